use std::sync::Arc;

use anyhow::Context;
use log::{error, info, trace, warn};
use winit::{
    application::ApplicationHandler,
    dpi::{LogicalSize, PhysicalPosition, PhysicalSize},
    event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes},
};

use crate::backend::wgpu_backend::WgpuAccelerator;
use crate::config::SimulationConfig;
use crate::error::SimulationError;
use crate::simulation::{distribution, ParticleField, SimulationSession};

/// Pixels of trackpad scroll that count as one wheel line.
const PIXELS_PER_LINE: f32 = 20.0;

pub struct UniverseApp {
    event_loop: Option<EventLoop<()>>,
    app_state: AppState,
}

struct AppState {
    config: SimulationConfig,
    window: Option<Arc<Window>>,
    session: Option<SimulationSession<WgpuAccelerator>>,
    /// Field loaded at startup, restored by the reset key.
    initial: Option<ParticleField>,
    dragging: bool,
    last_cursor: Option<PhysicalPosition<f64>>,
    failure: Option<anyhow::Error>,
}

impl UniverseApp {
    pub fn new(config: SimulationConfig) -> anyhow::Result<Self> {
        let event_loop = EventLoop::new().context("failed to create event loop")?;

        Ok(Self {
            event_loop: Some(event_loop),
            app_state: AppState {
                config,
                window: None,
                session: None,
                initial: None,
                dragging: false,
                last_cursor: None,
                failure: None,
            },
        })
    }

    /// Runs the event loop until the window closes or a fatal error occurs.
    pub fn run(mut self) -> anyhow::Result<()> {
        let event_loop = self
            .event_loop
            .take()
            .context("event loop already consumed")?;
        event_loop.set_control_flow(ControlFlow::Poll);
        event_loop
            .run_app(&mut self.app_state)
            .context("event loop terminated abnormally")?;

        match self.app_state.failure.take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl AppState {
    fn start(&mut self, window: Arc<Window>) -> anyhow::Result<()> {
        let mut accelerator = WgpuAccelerator::new(window, self.config.backends)?;
        let source = self.config.kernel_source()?;
        let mut session = SimulationSession::initialize(
            &mut accelerator,
            &source,
            &self.config.policy,
            self.config.parameters(),
        )?;

        let field = distribution::disc(
            &mut rand::rng(),
            self.config.particle_count,
            self.config.big_mass,
            self.config.gravitational_constant,
        )?;
        session.load_field(&field)?;

        self.initial = Some(field);
        self.session = Some(session);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, failure: anyhow::Error) {
        error!("{failure:#}");
        self.failure = Some(failure);
        event_loop.exit();
    }

    /// Fatal errors stop the application; anything else skips the frame.
    fn handle(&mut self, event_loop: &ActiveEventLoop, err: SimulationError) {
        if err.is_fatal() {
            self.fail(event_loop, err.into());
        } else {
            warn!("Skipping frame: {err}");
        }
    }

    fn frame(&mut self, event_loop: &ActiveEventLoop) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let result = session.step().and_then(|report| {
            trace!(
                "Cycle {} advanced {} particles by {}",
                report.cycle,
                report.particle_count,
                report.timestep
            );
            session.render()
        });
        if let Err(err) = result {
            self.handle(event_loop, err);
        }
    }

    fn reset(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(session), Some(initial)) = (self.session.as_mut(), self.initial.as_ref()) else {
            return;
        };
        if let Err(err) = session.load_field(initial) {
            self.handle(event_loop, err);
        }
    }

    fn key_pressed(&mut self, event_loop: &ActiveEventLoop, key_code: KeyCode) {
        match key_code {
            KeyCode::Escape => event_loop.exit(),
            KeyCode::Space => {
                if let Some(session) = self.session.as_mut() {
                    session.toggle_speed();
                }
            }
            KeyCode::KeyR => {
                info!("Resetting particles");
                self.reset(event_loop);
            }
            _ => (),
        }
    }
}

impl ApplicationHandler for AppState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = WindowAttributes::default()
            .with_title(self.config.title.clone())
            .with_inner_size(LogicalSize::new(
                self.config.window_width,
                self.config.window_height,
            ));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("failed to create window"));
                return;
            }
        };
        self.window = Some(window.clone());

        if let Err(failure) = self.start(window) {
            self.fail(event_loop, failure);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key_code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => self.key_pressed(event_loop, key_code),
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.dragging = state == ElementState::Pressed;
            }
            WindowEvent::CursorMoved { position, .. } => {
                if let (true, Some(last), Some(session)) =
                    (self.dragging, self.last_cursor, self.session.as_mut())
                {
                    session
                        .rasterizer_mut()
                        .camera_mut()
                        .rotate((position.x - last.x) as f32, (position.y - last.y) as f32);
                }
                self.last_cursor = Some(position);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(position) => position.y as f32 / PIXELS_PER_LINE,
                };
                if let Some(session) = self.session.as_mut() {
                    session.rasterizer_mut().camera_mut().zoom(lines);
                }
            }
            WindowEvent::Resized(PhysicalSize { width, height }) => {
                if let Some(session) = self.session.as_mut() {
                    session.resize(width, height);
                }
            }
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => self.frame(event_loop),
            _ => (),
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(session) = self.session.as_ref() {
            info!(
                "Ran {} cycles ({} failed)",
                session.controller().cycles(),
                session.controller().failures()
            );
        }
    }
}
