//! Point Rasterizer
//!
//! Draws every particle as a camera-facing disc with a single instanced
//! draw call. The three per-instance vertex buffers (position, color,
//! mass) are the same allocations the compute kernel writes, so nothing is
//! copied between simulation and drawing.

use log::{debug, warn};
use wgpu::util::DeviceExt;

use super::camera::{CameraUniform, OrbitCamera};
use crate::backend::wgpu_backend::{check_storage_size, GpuContext, InteropBuffer};
use crate::backend::{RasterBufferId, Rasterizer};
use crate::error::BackendError;
use crate::wgpu_utils::{wait_idle, UniformBuffer};

const POINT_SHADER: &str = include_str!("shaders/points.wgsl");

/// Vertex buffer layouts in the order `draw` expects its buffers.
const INSTANCE_LAYOUTS: [wgpu::VertexBufferLayout<'static>; 3] = [
    wgpu::VertexBufferLayout {
        array_stride: 16,
        step_mode: wgpu::VertexStepMode::Instance,
        attributes: &[wgpu::VertexAttribute {
            offset: 0,
            shader_location: 0,
            format: wgpu::VertexFormat::Float32x4,
        }],
    },
    wgpu::VertexBufferLayout {
        array_stride: 16,
        step_mode: wgpu::VertexStepMode::Instance,
        attributes: &[wgpu::VertexAttribute {
            offset: 0,
            shader_location: 1,
            format: wgpu::VertexFormat::Float32x4,
        }],
    },
    wgpu::VertexBufferLayout {
        array_stride: 4,
        step_mode: wgpu::VertexStepMode::Instance,
        attributes: &[wgpu::VertexAttribute {
            offset: 0,
            shader_location: 2,
            format: wgpu::VertexFormat::Float32,
        }],
    },
];

const BACKGROUND: wgpu::Color = wgpu::Color {
    r: 0.0,
    g: 0.0,
    b: 0.02,
    a: 1.0,
};

/// Surface size for a `width` x `height` window, within what the device can
/// render to.
fn surface_extent(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let max_dimension = max_dimension.max(1);
    (width.clamp(1, max_dimension), height.clamp(1, max_dimension))
}

pub struct PointRasterizer {
    context: GpuContext,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    pipeline: wgpu::RenderPipeline,
    camera: OrbitCamera,
    camera_ubo: UniformBuffer<CameraUniform>,
    camera_bind_group: wgpu::BindGroup,
    buffers: Vec<Option<InteropBuffer>>,
}

impl PointRasterizer {
    pub fn new(
        context: GpuContext,
        surface: wgpu::Surface<'static>,
        adapter: &wgpu::Adapter,
        width: u32,
        height: u32,
    ) -> Result<Self, BackendError> {
        let device = &context.device;
        let surface_capabilities = surface.get_capabilities(adapter);
        let format = surface_capabilities
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_capabilities.formats.first().copied())
            .ok_or_else(|| BackendError::call("configure surface", "no supported surface format"))?;
        let alpha_mode = surface_capabilities
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let (surface_width, surface_height) =
            surface_extent(width, height, device.limits().max_texture_dimension_2d);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: surface_width,
            height: surface_height,
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(device, &config);

        let mut camera = OrbitCamera::default();
        camera.resize_projection(width.max(1), height.max(1));
        let camera_ubo = UniformBuffer::new(device, &camera.uniform());

        let camera_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Camera Bind Group Layout"),
            entries: &[UniformBuffer::<CameraUniform>::layout_entry(
                0,
                wgpu::ShaderStages::VERTEX,
            )],
        });
        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Camera Bind Group"),
            layout: &camera_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_ubo.binding_resource(),
            }],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Point Shader"),
            source: wgpu::ShaderSource::Wgsl(POINT_SHADER.into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Point Pipeline Layout"),
            bind_group_layouts: &[&camera_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Point Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &INSTANCE_LAYOUTS,
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            context,
            surface,
            config,
            pipeline,
            camera,
            camera_ubo,
            camera_bind_group,
            buffers: Vec::new(),
        })
    }

    pub fn camera(&self) -> &OrbitCamera {
        &self.camera
    }

    /// Camera changes take effect on the next draw.
    pub fn camera_mut(&mut self) -> &mut OrbitCamera {
        &mut self.camera
    }

    fn buffer(&self, id: RasterBufferId) -> Result<&InteropBuffer, BackendError> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "raster buffer",
                index: id.0,
            })
    }

    fn reconfigure(&mut self) {
        self.surface.configure(&self.context.device, &self.config);
    }
}

impl Rasterizer for PointRasterizer {
    type Shared = InteropBuffer;

    fn create_shared_buffer(
        &mut self,
        label: &str,
        bytes: &[u8],
    ) -> Result<RasterBufferId, BackendError> {
        check_storage_size(label, bytes.len(), &self.context.device.limits())?;
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytes,
                usage: wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });
        let id = RasterBufferId(self.buffers.len());
        self.buffers.push(Some(InteropBuffer::new(buffer, label)));
        debug!("Created vertex buffer {label} ({} bytes)", bytes.len());
        Ok(id)
    }

    fn export_shared(&self, id: RasterBufferId) -> Result<InteropBuffer, BackendError> {
        self.buffer(id).cloned()
    }

    fn write_shared_buffer(&mut self, id: RasterBufferId, bytes: &[u8]) -> Result<(), BackendError> {
        let buffer = self.buffer(id)?;
        buffer.ensure_released("raster write while compute owns the buffer")?;
        if buffer.buffer().size() != bytes.len() as u64 {
            return Err(BackendError::call(
                "write vertex buffer",
                format!("buffer holds {} bytes, got {}", buffer.buffer().size(), bytes.len()),
            ));
        }
        self.context.queue.write_buffer(buffer.buffer(), 0, bytes);
        Ok(())
    }

    fn destroy_shared_buffer(&mut self, id: RasterBufferId) -> Result<(), BackendError> {
        self.buffer(id)?.ensure_released("destroyed while compute owns the buffer")?;
        self.buffers[id.0] = None;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BackendError> {
        wait_idle(&self.context.device, "finish raster queue")
    }

    fn draw(&mut self, buffers: &[RasterBufferId], particle_count: u32) -> Result<(), BackendError> {
        if buffers.len() != INSTANCE_LAYOUTS.len() {
            return Err(BackendError::call(
                "draw",
                format!("expected {} vertex buffers, got {}", INSTANCE_LAYOUTS.len(), buffers.len()),
            ));
        }
        let mut vertex_buffers = Vec::with_capacity(buffers.len());
        for id in buffers {
            let buffer = self.buffer(*id)?;
            buffer.ensure_released("drawn while compute owns the buffer")?;
            vertex_buffers.push(buffer.clone());
        }

        let uniform = self.camera.uniform();
        self.camera_ubo.update_content(&self.context.queue, &uniform);

        let surface_texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                debug!("Surface lost or outdated, reconfiguring");
                self.reconfigure();
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                warn!("Surface timed out, skipping frame");
                return Ok(());
            }
            Err(e) => return Err(BackendError::call("acquire surface texture", e.to_string())),
        };
        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Point Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Point Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(BACKGROUND),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &self.camera_bind_group, &[]);
            for (slot, buffer) in vertex_buffers.iter().enumerate() {
                render_pass.set_vertex_buffer(slot as u32, buffer.buffer().slice(..));
            }
            render_pass.draw(0..6, 0..particle_count);
        }

        self.context.queue.submit(std::iter::once(encoder.finish()));
        surface_texture.present();
        Ok(())
    }

    fn update_viewport(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let (surface_width, surface_height) = surface_extent(
            width,
            height,
            self.context.device.limits().max_texture_dimension_2d,
        );
        if (surface_width, surface_height) != (width, height) {
            debug!("Clamped {width}x{height} surface to {surface_width}x{surface_height}");
        }
        self.config.width = surface_width;
        self.config.height = surface_height;
        self.reconfigure();
        self.camera.resize_projection(width, height);
    }
}
