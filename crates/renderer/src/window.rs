use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, trace};
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, KeyEvent, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoopBuilder, EventLoopProxy};
use winit::keyboard::{Key, NamedKey};
use winit::window::WindowBuilder;

use crate::frame::{FrameOutcome, FramePipeline, FrameReport, PipelineHandles};
use crate::gpu::{GpuContext, WgpuBackend};
use crate::input::{InputEvent, PointerTracker};
use crate::types::RendererConfig;

/// Pointer events buffered before the oldest are dropped.
const INPUT_QUEUE: usize = 256;

#[derive(Debug, Clone)]
enum WindowCommand {
    SetVsync(bool),
    Shutdown,
}

/// Rendering actor running the frame pipeline on its own thread.
///
/// The caller keeps the GUI side: it writes parameters and queues reloads
/// through the [`PipelineHandles`] returned by [`WindowRuntime::handles`],
/// and reacts to pointer input from [`WindowRuntime::input`].
pub struct WindowRuntime {
    proxy: EventLoopProxy<WindowCommand>,
    handles: PipelineHandles,
    input: Receiver<InputEvent>,
    join_handle: Option<JoinHandle<Result<()>>>,
}

type Ready = Result<(EventLoopProxy<WindowCommand>, PipelineHandles)>;

impl WindowRuntime {
    pub fn spawn(config: RendererConfig) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded(1);
        let (input_tx, input_rx) = bounded(INPUT_QUEUE);
        let handle = thread::Builder::new()
            .name("computeshader-render".into())
            .spawn(move || run_window_thread(config, ready_tx, input_tx))
            .map_err(|err| anyhow!("failed to spawn render thread: {err}"))?;

        let (proxy, handles) = ready_rx
            .recv()
            .map_err(|err| anyhow!("render thread failed to initialise: {err}"))??;

        Ok(Self {
            proxy,
            handles,
            input: input_rx,
            join_handle: Some(handle),
        })
    }

    pub fn handles(&self) -> &PipelineHandles {
        &self.handles
    }

    /// Pointer input from the window; disconnects once the window closes.
    pub fn input(&self) -> &Receiver<InputEvent> {
        &self.input
    }

    pub fn set_vsync(&self, enabled: bool) -> Result<()> {
        self.proxy
            .send_event(WindowCommand::SetVsync(enabled))
            .map_err(|err| anyhow!(err))
    }

    /// Blocks until the window is closed.
    pub fn wait(mut self) -> Result<()> {
        match self.join_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|err| anyhow!("render thread panicked: {err:?}"))?,
            None => Ok(()),
        }
    }

    pub fn shutdown(mut self) -> Result<()> {
        if let Some(handle) = self.join_handle.take() {
            let _ = self.proxy.send_event(WindowCommand::Shutdown);
            handle
                .join()
                .map_err(|err| anyhow!("render thread panicked: {err:?}"))??;
        }
        Ok(())
    }
}

impl Drop for WindowRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = self.proxy.send_event(WindowCommand::Shutdown);
            let _ = handle.join();
        }
    }
}

/// Frame counters logged once per second.
struct FrameStats {
    window_start: Instant,
    frames: u32,
    skipped: u32,
    total: u64,
}

impl FrameStats {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            skipped: 0,
            total: 0,
        }
    }

    fn record(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.total += 1;
        if !matches!(report.outcome, FrameOutcome::Rendered { .. }) {
            self.skipped += 1;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            debug!(
                fps = (self.frames as f32 / elapsed.as_secs_f32()).round(),
                skipped = self.skipped,
                frame_count = self.total,
                "render stats"
            );
            self.window_start = Instant::now();
            self.frames = 0;
            self.skipped = 0;
        }
    }
}

enum KeyAction {
    Exit,
    ReloadAll,
}

fn key_action(event: &KeyEvent) -> Option<KeyAction> {
    if event.state != ElementState::Pressed || event.repeat {
        return None;
    }
    match &event.logical_key {
        Key::Named(NamedKey::Escape) => Some(KeyAction::Exit),
        Key::Character(value) if value.eq_ignore_ascii_case("r") => Some(KeyAction::ReloadAll),
        _ => None,
    }
}

fn forward(input: &Sender<InputEvent>, event: Option<InputEvent>) {
    let Some(event) = event else {
        return;
    };
    if let Err(TrySendError::Full(event)) = input.try_send(event) {
        trace!(?event, "input queue full; dropping event");
    }
}

fn run_window_thread(
    config: RendererConfig,
    ready_tx: Sender<Ready>,
    input: Sender<InputEvent>,
) -> Result<()> {
    let mut builder = EventLoopBuilder::<WindowCommand>::with_user_event();
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use winit::platform::wayland::EventLoopBuilderExtWayland;
        EventLoopBuilderExtWayland::with_any_thread(&mut builder, true);
    }
    #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    {
        use winit::platform::x11::EventLoopBuilderExtX11;
        EventLoopBuilderExtX11::with_any_thread(&mut builder, true);
    }

    let mut setup = || -> Result<_> {
        let event_loop = builder
            .build()
            .map_err(|err| anyhow!("failed to create event loop: {err}"))?;
        let window = WindowBuilder::new()
            .with_title(config.title.as_str())
            .with_inner_size(PhysicalSize::new(config.surface_size.0, config.surface_size.1))
            .build(&event_loop)
            .map_err(|err| anyhow!("failed to create window: {err}"))?;
        let window = Arc::new(window);
        let context = GpuContext::new(window.as_ref(), window.inner_size(), config.vsync)?;
        let pipeline = FramePipeline::new(WgpuBackend::new(context), config.scene.clone())
            .map_err(|err| anyhow!("scene cannot be rendered: {err}"))?;
        Ok((event_loop, window, pipeline))
    };

    let (event_loop, window, mut pipeline) = match setup() {
        Ok(parts) => parts,
        Err(err) => {
            let message = format!("failed to initialise renderer: {err:#}");
            let _ = ready_tx.send(Err(anyhow!(message.clone())));
            return Err(anyhow!(message));
        }
    };

    let reloads = pipeline.reload_handle();
    let _ = ready_tx.send(Ok((event_loop.create_proxy(), pipeline.handles())));
    info!(title = %config.title, "render loop started");

    let mut stats = FrameStats::new();
    let mut pointer = PointerTracker::default();
    let run_result = event_loop.run(move |event, elwt| match event {
        Event::UserEvent(WindowCommand::SetVsync(enabled)) => {
            pipeline.backend_mut().set_vsync(enabled);
        }
        Event::UserEvent(WindowCommand::Shutdown) => elwt.exit(),
        Event::WindowEvent { window_id, event } if window_id == window.id() => match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => elwt.exit(),
            WindowEvent::KeyboardInput { event, .. } => match key_action(&event) {
                Some(KeyAction::Exit) => elwt.exit(),
                Some(KeyAction::ReloadAll) => {
                    info!("reloading every program");
                    reloads.reload_all();
                }
                None => {}
            },
            WindowEvent::Resized(size) => {
                if size.width > 0 && size.height > 0 {
                    pipeline.resize((size.width, size.height));
                    forward(
                        &input,
                        Some(InputEvent::Resized {
                            width: size.width,
                            height: size.height,
                        }),
                    );
                }
            }
            WindowEvent::MouseInput { state, button, .. } => pointer.button(button, state),
            WindowEvent::CursorMoved { position, .. } => {
                forward(&input, pointer.moved(position.x, position.y));
            }
            WindowEvent::CursorLeft { .. } => pointer.left(),
            WindowEvent::MouseWheel { delta, .. } => forward(&input, pointer.wheel(delta)),
            WindowEvent::RedrawRequested => {
                let report = pipeline.render_frame();
                stats.record(&report);
                if let Some(err) = &report.present_error {
                    error!(error = %err, "presentation failed; closing window");
                    elwt.exit();
                }
            }
            _ => {}
        },
        Event::AboutToWait => {
            window.request_redraw();
            elwt.set_control_flow(ControlFlow::Wait);
        }
        _ => {}
    });

    run_result.map_err(|err| anyhow!("window event loop error: {err}"))
}
