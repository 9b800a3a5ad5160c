//! wgpu render context.
//!
//! Headless: draws into an offscreen texture and reads it back for the
//! encoder input. The pass-through pipeline always runs; the overlay pipeline
//! adds a second draw in the same pass when a watermark rect is given. The
//! overlay texture itself is drawn by a glyphon `TextRenderer` whenever the
//! timestamp text changes.

use bytemuck::{Pod, Zeroable};
use glyphon::{Cache, Resolution, TextArea, TextAtlas, TextBounds, TextRenderer, Viewport};

use super::context::{DrawParams, RenderContext};
use super::overlay::{
    TimestampOverlay, BACKGROUND, OVERLAY_HEIGHT, OVERLAY_WIDTH, TEXT_COLOR, TEXT_LEFT, TEXT_TOP,
};
use crate::error::{RecorderError, RecorderResult};
use crate::media::{FrameSize, VideoFrame};

const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PassthroughUniforms {
    flags: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct OverlayUniforms {
    rect: [f32; 4],
    uv_scale: [f32; 4],
}

struct SizedTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: FrameSize,
}

struct ShaderPath {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    uniforms: wgpu::Buffer,
}

pub struct WgpuRenderContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    sampler: wgpu::Sampler,
    passthrough: ShaderPath,
    overlay_path: ShaderPath,
    input: Option<SizedTexture>,
    overlay: SizedTexture,
    text_atlas: TextAtlas,
    text_renderer: TextRenderer,
    viewport: Viewport,
    output: Option<SizedTexture>,
    released: bool,
}

impl WgpuRenderContext {
    /// Acquire an adapter and device. Blocks the calling thread.
    pub fn new() -> RecorderResult<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> RecorderResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| RecorderError::RenderError(format!("Failed to find GPU adapter: {}", e)))?;

        log::info!("[RENDERER] Using GPU adapter: {:?}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("recorder-render-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| RecorderError::RenderError(format!("Failed to create GPU device: {}", e)))?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("frame-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let passthrough = create_shader_path(
            &device,
            "passthrough",
            include_str!("shaders/passthrough.wgsl"),
            std::mem::size_of::<PassthroughUniforms>() as u64,
            None,
        );
        let overlay_path = create_shader_path(
            &device,
            "overlay",
            include_str!("shaders/overlay.wgsl"),
            std::mem::size_of::<OverlayUniforms>() as u64,
            Some(wgpu::BlendState::ALPHA_BLENDING),
        );
        let overlay = create_texture(
            &device,
            "overlay-texture",
            FrameSize::new(OVERLAY_WIDTH, OVERLAY_HEIGHT),
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT,
        );

        let cache = Cache::new(&device);
        let viewport = Viewport::new(&device, &cache);
        let mut text_atlas = TextAtlas::new(&device, &queue, &cache, TEXTURE_FORMAT);
        let text_renderer = TextRenderer::new(
            &mut text_atlas,
            &device,
            wgpu::MultisampleState::default(),
            None,
        );

        Ok(Self {
            device,
            queue,
            sampler,
            passthrough,
            overlay_path,
            input: None,
            overlay,
            text_atlas,
            text_renderer,
            viewport,
            output: None,
            released: false,
        })
    }

    fn ensure_live(&self) -> RecorderResult<()> {
        if self.released {
            return Err(RecorderError::Released("render context"));
        }
        Ok(())
    }

    fn write_rgba(&self, texture: &wgpu::Texture, data: &[u8], size: FrameSize) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * size.width),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );
    }

    fn bind_group(&self, path: &ShaderPath, view: &wgpu::TextureView) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &path.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: path.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }

    fn read_output(&self, output: &SizedTexture) -> RecorderResult<Vec<u8>> {
        let FrameSize { width, height } = output.size;
        let bytes_per_row = 4 * width;
        // Copies need rows aligned to 256 bytes
        let padded_bytes_per_row = (bytes_per_row + 255) & !255;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output-readback"),
            size: (padded_bytes_per_row * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("output-readback-encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &output.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            extent(output.size),
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| RecorderError::RenderError(format!("GPU poll failed: {}", e)))?;
        rx.recv()
            .map_err(|_| RecorderError::RenderError("readback callback dropped".to_string()))?
            .map_err(|e| RecorderError::RenderError(format!("readback map failed: {}", e)))?;

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((bytes_per_row * height) as usize);
        for row in 0..height as usize {
            let start = row * padded_bytes_per_row as usize;
            pixels.extend_from_slice(&mapped[start..start + bytes_per_row as usize]);
        }
        drop(mapped);
        buffer.unmap();
        Ok(pixels)
    }
}

impl RenderContext for WgpuRenderContext {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn import_frame(&mut self, frame: &VideoFrame) -> RecorderResult<()> {
        self.ensure_live()?;
        if !frame.is_well_formed() {
            return Err(RecorderError::RenderError(format!(
                "frame buffer of {} bytes does not match {}",
                frame.data.len(),
                frame.size
            )));
        }
        if self.input.as_ref().map(|t| t.size) != Some(frame.size) {
            log::debug!("[RENDERER] Creating input texture {}", frame.size);
            self.input = Some(create_texture(
                &self.device,
                "camera-input-texture",
                frame.size,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            ));
        }
        if let Some(input) = self.input.as_ref() {
            self.write_rgba(&input.texture, &frame.data, frame.size);
        }
        Ok(())
    }

    fn upload_overlay(&mut self, overlay: &mut TimestampOverlay) -> RecorderResult<()> {
        self.ensure_live()?;
        let (font_system, swash_cache, buffer) = overlay.glyphon_parts();
        self.viewport.update(
            &self.queue,
            Resolution {
                width: OVERLAY_WIDTH,
                height: OVERLAY_HEIGHT,
            },
        );
        let area = TextArea {
            buffer,
            left: TEXT_LEFT,
            top: TEXT_TOP,
            scale: 1.0,
            bounds: TextBounds {
                left: 0,
                top: 0,
                right: OVERLAY_WIDTH as i32,
                bottom: OVERLAY_HEIGHT as i32,
            },
            default_color: TEXT_COLOR,
            custom_glyphs: &[],
        };
        self.text_renderer
            .prepare(
                &self.device,
                &self.queue,
                font_system,
                &mut self.text_atlas,
                &self.viewport,
                [area],
                swash_cache,
            )
            .map_err(|e| RecorderError::RenderError(format!("Failed to prepare overlay text: {:?}", e)))?;

        let [r, g, b, a] = BACKGROUND.0.map(|c| c as f64 / 255.0);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("overlay-text-encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("overlay-text-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.overlay.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            self.text_renderer
                .render(&self.text_atlas, &self.viewport, &mut pass)
                .map_err(|e| RecorderError::RenderError(format!("Failed to render overlay text: {:?}", e)))?;
        }
        self.queue.submit(Some(encoder.finish()));
        self.text_atlas.trim();
        Ok(())
    }

    fn draw(&mut self, params: &DrawParams) -> RecorderResult<Vec<u8>> {
        self.ensure_live()?;
        if self.output.as_ref().map(|t| t.size) != Some(params.output_size) {
            self.output = Some(create_texture(
                &self.device,
                "encoder-output-texture",
                params.output_size,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            ));
        }
        let (Some(input), Some(output)) = (self.input.as_ref(), self.output.as_ref()) else {
            return Err(RecorderError::RenderError("no input frame imported".to_string()));
        };

        let flags = PassthroughUniforms {
            flags: [if params.mirror { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
        };
        self.queue
            .write_buffer(&self.passthrough.uniforms, 0, bytemuck::bytes_of(&flags));
        let frame_group = self.bind_group(&self.passthrough, &input.view);

        let overlay_group = match params.overlay.filter(|rect| !rect.is_empty()) {
            Some(rect) => {
                let out_w = params.output_size.width.max(1) as f32;
                let out_h = params.output_size.height.max(1) as f32;
                let uniforms = OverlayUniforms {
                    rect: [
                        rect.x as f32 / out_w * 2.0 - 1.0,
                        1.0 - rect.y as f32 / out_h * 2.0,
                        (rect.x + rect.width) as f32 / out_w * 2.0 - 1.0,
                        1.0 - (rect.y + rect.height) as f32 / out_h * 2.0,
                    ],
                    uv_scale: [
                        rect.width as f32 / OVERLAY_WIDTH as f32,
                        rect.height as f32 / OVERLAY_HEIGHT as f32,
                        0.0,
                        0.0,
                    ],
                };
                self.queue
                    .write_buffer(&self.overlay_path.uniforms, 0, bytemuck::bytes_of(&uniforms));
                Some(self.bind_group(&self.overlay_path, &self.overlay.view))
            },
            None => None,
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("frame-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output.view,
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
            pass.set_pipeline(&self.passthrough.pipeline);
            pass.set_bind_group(0, &frame_group, &[]);
            pass.draw(0..3, 0..1);

            if let Some(group) = overlay_group.as_ref() {
                pass.set_pipeline(&self.overlay_path.pipeline);
                pass.set_bind_group(0, group, &[]);
                pass.draw(0..6, 0..1);
            }
        }
        self.queue.submit(Some(encoder.finish()));

        self.read_output(output)
    }

    fn reset_output(&mut self) {
        if let Some(output) = self.output.take() {
            output.texture.destroy();
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.reset_output();
        if let Some(input) = self.input.take() {
            input.texture.destroy();
        }
        self.overlay.texture.destroy();
        log::debug!("[RENDERER] GPU context released");
    }
}

impl Drop for WgpuRenderContext {
    fn drop(&mut self) {
        self.release();
    }
}

fn extent(size: FrameSize) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    size: FrameSize,
    usage: wgpu::TextureUsages,
) -> SizedTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: extent(size),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TEXTURE_FORMAT,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    SizedTexture {
        texture,
        view,
        size,
    }
}

fn create_shader_path(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    uniform_size: u64,
    blend: Option<wgpu::BlendState>,
) -> ShaderPath {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: TEXTURE_FORMAT,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
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

    let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: uniform_size,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    ShaderPath {
        pipeline,
        layout,
        uniforms,
    }
}
