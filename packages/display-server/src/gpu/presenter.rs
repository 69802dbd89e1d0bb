//! Headless wgpu presenter.

use std::path::PathBuf;

use bytemuck::{Pod, Zeroable};
use image::{DynamicImage, Rgba32FImage, RgbaImage};
use wgpu::util::DeviceExt;

use crate::config::ViewerConfig;
use crate::error::{DisplayError, Result};
use crate::viewer::Viewer;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Vertex for fullscreen quad rendering.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    uv: [f32; 2],
}

impl QuadVertex {
    const ATTRIBS: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

    fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBS,
        }
    }
}

/// Two triangles covering NDC, uv origin at the top-left.
const QUAD_VERTICES: &[QuadVertex] = &[
    QuadVertex { position: [-1.0, -1.0], uv: [0.0, 1.0] },
    QuadVertex { position: [ 1.0, -1.0], uv: [1.0, 1.0] },
    QuadVertex { position: [ 1.0,  1.0], uv: [1.0, 0.0] },
    QuadVertex { position: [-1.0, -1.0], uv: [0.0, 1.0] },
    QuadVertex { position: [ 1.0,  1.0], uv: [1.0, 0.0] },
    QuadVertex { position: [-1.0,  1.0], uv: [0.0, 0.0] },
];

/// Uploaded frame texture, recreated when the frame size changes.
struct FrameSource {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    quad_vertex_buffer: wgpu::Buffer,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    output_buffer: wgpu::Buffer,
    padded_bytes_per_row: u32,
    width: u32,
    height: u32,
    source: Option<FrameSource>,
}

impl GpuContext {
    async fn new(width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None, // Headless
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| DisplayError::Gpu("no adapter found".to_string()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default(), None)
            .await
            .map_err(|e| DisplayError::Gpu(format!("request_device: {}", e)))?;

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Present Target"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        // Rows copied out of a texture must be 256-byte aligned.
        let unpadded_bytes_per_row = 4 * width;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;
        let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Present Readback Buffer"),
            size: (padded_bytes_per_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let quad_vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Fullscreen Quad Buffer"),
            contents: bytemuck::cast_slice(QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Present Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Present Texture Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Present Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shader_present.wgsl").into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Present Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Present Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::desc()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            quad_vertex_buffer,
            target,
            target_view,
            output_buffer,
            padded_bytes_per_row,
            width,
            height,
            source: None,
        })
    }

    fn upload(&mut self, frame: &RgbaImage) {
        let (width, height) = frame.dimensions();
        let stale = self
            .source
            .as_ref()
            .map_or(true, |s| (s.width, s.height) != (width, height));
        if stale {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Frame Texture"),
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Frame Bind Group"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    },
                ],
            });
            self.source = Some(FrameSource {
                texture,
                bind_group,
                width,
                height,
            });
        }

        if let Some(source) = &self.source {
            self.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &source.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                frame.as_raw(),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * width),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            );
        }
    }

    /// Blit the uploaded frame to the target and read it back.
    fn render(&self) -> Result<RgbaImage> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| DisplayError::Gpu("no frame uploaded".to_string()))?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Present Encoder") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &source.bind_group, &[]);
            pass.set_vertex_buffer(0, self.quad_vertex_buffer.slice(..));
            pass.draw(0..QUAD_VERTICES.len() as u32, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.output_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = self.output_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| DisplayError::Gpu(format!("readback channel: {}", e)))?
            .map_err(|e| DisplayError::Gpu(format!("map_async: {}", e)))?;

        let pixels = {
            let data = buffer_slice.get_mapped_range();
            let row_bytes = (4 * self.width) as usize;
            let mut unpadded = Vec::with_capacity(row_bytes * self.height as usize);
            for row in 0..self.height as usize {
                let start = row * self.padded_bytes_per_row as usize;
                unpadded.extend_from_slice(&data[start..start + row_bytes]);
            }
            unpadded
        };
        self.output_buffer.unmap();

        RgbaImage::from_raw(self.width, self.height, pixels)
            .ok_or_else(|| DisplayError::Gpu("readback size mismatch".to_string()))
    }
}

/// [`Viewer`] that presents through a headless GPU device.
///
/// The device is created by `configure`, sized from the viewer config.
#[derive(Default)]
pub struct GpuPresenter {
    context: Option<GpuContext>,
    frame_limit: Option<u64>,
    output_dir: Option<PathBuf>,
    frames_presented: u64,
    last_readback: Option<RgbaImage>,
    cursor_visible: bool,
    window_name: String,
}

impl GpuPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// What the GPU target held after the last present.
    pub fn last_readback(&self) -> Option<&RgbaImage> {
        self.last_readback.as_ref()
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn window_name(&self) -> &str {
        &self.window_name
    }
}

impl Viewer for GpuPresenter {
    fn configure(&mut self, config: &ViewerConfig) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                DisplayError::Configuration(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        let context = pollster::block_on(GpuContext::new(config.width, config.height))?;
        log::info!("GPU presenter ready at {}x{}", config.width, config.height);
        self.context = Some(context);
        self.cursor_visible = config.cursor_visible;
        Ok(())
    }

    fn present(&mut self, frame: &Rgba32FImage) -> Result<()> {
        let context = self
            .context
            .as_mut()
            .ok_or_else(|| DisplayError::Gpu("presenter not configured".to_string()))?;
        let rgba8 = DynamicImage::ImageRgba32F(frame.clone()).to_rgba8();
        context.upload(&rgba8);
        let readback = context.render()?;

        if let Some(dir) = &self.output_dir {
            let path = dir.join(format!("frame_{:05}.png", self.frames_presented));
            readback
                .save(&path)
                .map_err(|e| DisplayError::Capture(format!("{}: {}", path.display(), e)))?;
        }
        self.frames_presented += 1;
        self.last_readback = Some(readback);
        Ok(())
    }

    fn done(&self) -> bool {
        self.frame_limit
            .map_or(false, |limit| self.frames_presented >= limit)
    }

    fn set_cursor_visible(&mut self, visible: bool) {
        self.cursor_visible = visible;
    }

    fn set_window_name(&mut self, name: &str) {
        log::debug!("GPU presenter title: {}", name);
        self.window_name = name.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_present_before_configure_fails() {
        let mut presenter = GpuPresenter::new();
        let frame = Rgba32FImage::from_pixel(2, 2, Rgba([1.0, 1.0, 1.0, 1.0]));
        assert!(matches!(presenter.present(&frame), Err(DisplayError::Gpu(_))));
    }

    #[test]
    fn test_window_settings_apply_without_a_device() {
        let mut presenter = GpuPresenter::new();
        assert_eq!(presenter.window_name(), "");
        presenter.set_window_name("dome left");
        presenter.set_cursor_visible(true);
        assert_eq!(presenter.window_name(), "dome left");
        assert!(presenter.cursor_visible());
        presenter.set_cursor_visible(false);
        assert!(!presenter.cursor_visible());
    }

    #[test]
    fn test_uniform_frame_survives_scaling() {
        let mut presenter = GpuPresenter::new();
        let config = ViewerConfig {
            width: 32,
            height: 16,
            ..ViewerConfig::default()
        };
        if presenter.configure(&config).is_err() {
            // No adapter on this machine.
            return;
        }
        let frame = Rgba32FImage::from_pixel(8, 8, Rgba([1.0, 0.0, 0.0, 1.0]));
        presenter.present(&frame).unwrap();

        let readback = presenter.last_readback().unwrap();
        assert_eq!(readback.dimensions(), (32, 16));
        let px = readback.get_pixel(16, 8).0;
        assert!(px[0] >= 250 && px[1] <= 5 && px[2] <= 5);
    }
}
