//! Frame scheduler and main loop
//!
//! Every wakeup of the event loop is followed by one [`FrameScheduler::tick`]:
//! dispatch client requests, deliver queued configures, then either wait out
//! in-flight uploads (redrawing as each one lands) or redraw only when
//! something visible changed.

use anyhow::{Context, Result};
use calloop::channel::{self, Channel};
use calloop::generic::Generic;
use calloop::{EventLoop, Interest, Mode, PostAction};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use wayland_server::{Display, ListeningSocket};

use crate::config::CompositorConfig;
use crate::drm::DrmBackend;
use crate::input::{InputEvent, InputRouter};
use crate::protocol::{self, CompositorState, OutputInfo};
use crate::render::{KmsOutput, Presenter, SwapStatus};

/// Sleep between fence polls while an upload is in flight
const FENCE_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Upper bound on fence polls in one tick; the rest carries over
const FENCE_POLL_LIMIT: u32 = 2000;

/// Event loop timeout while a frame is owed to the display
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

pub struct FrameScheduler<P: Presenter> {
    presenter: P,
    vsync: bool,
    /// Surface count at the last presented frame
    last_count: usize,
    needs_redraw: bool,
    frames: u64,
}

impl<P: Presenter> FrameScheduler<P> {
    /// The first tick always presents, so the output is cleared at startup
    pub fn new(presenter: P, vsync: bool) -> Self {
        Self {
            presenter,
            vsync,
            last_count: 0,
            needs_redraw: true,
            frames: 0,
        }
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    /// A frame is owed: a swap was refused or an upload is still pending
    pub fn needs_redraw(&self) -> bool {
        self.needs_redraw
    }

    /// Frames handed to the display so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn tick(
        &mut self,
        display: &mut Display<CompositorState>,
        state: &mut CompositorState,
    ) -> Result<()> {
        display
            .dispatch_clients(state)
            .context("Failed to dispatch client requests")?;
        state.flush_configures();
        state.reap_clients();

        if state.has_writing() {
            self.settle_uploads(state)?;
        } else if self.needs_redraw
            || state.surface_count() != self.last_count
            || state.has_unbound_callbacks()
        {
            self.redraw(state)?;
        }

        display
            .flush_clients()
            .context("Failed to flush clients")?;
        Ok(())
    }

    fn settle_uploads(&mut self, state: &mut CompositorState) -> Result<()> {
        let mut polls = 0;
        while state.has_writing() {
            if state.poll_textures() {
                self.redraw(state)?;
                continue;
            }
            polls += 1;
            if polls >= FENCE_POLL_LIMIT {
                debug!("uploads still pending after {} polls", polls);
                self.needs_redraw = true;
                return Ok(());
            }
            thread::sleep(FENCE_POLL_INTERVAL);
        }
        Ok(())
    }

    fn redraw(&mut self, state: &mut CompositorState) -> Result<()> {
        self.presenter.begin_frame();
        for (texture, dst) in state.drawables() {
            self.presenter.draw_texture(texture, dst, false);
        }
        let status = self
            .presenter
            .swap(self.vsync)
            .context("Failed to present a frame")?;
        match status {
            SwapStatus::Presented => {
                self.frames += 1;
                self.needs_redraw = false;
                self.last_count = state.surface_count();
                state.fire_unbound_callbacks();
            }
            SwapStatus::Busy => {
                debug!("display busy, frame deferred");
                self.needs_redraw = true;
            }
            SwapStatus::Dropped => {
                debug!("frame dropped, waiting for the next change");
            }
        }
        Ok(())
    }
}

/// Bring up the display, serve clients until SIGINT/SIGTERM, tear down.
pub fn run(config: &CompositorConfig) -> Result<()> {
    let requested = config
        .requested_size()
        .map(|size| (size.width, size.height));
    let drm = DrmBackend::open(&config.drm.device, config.drm.connector, requested)
        .context("Failed to initialise the DRM backend")?;
    let (width, height) = drm.size();
    let refresh = drm.output().mode.vrefresh();
    let mut output_info = OutputInfo::new(width, height, refresh);
    output_info.make = "kmsbox".into();
    output_info.model = format!("connector-{}", drm.output().connector_index);

    let (output, textures) = KmsOutput::new(drm)?;
    let dmabuf = textures.supports_dmabuf();
    // Declared before the state so the state's textures go first
    let mut scheduler = FrameScheduler::new(output, config.output.vsync);

    let mut display: Display<CompositorState> =
        Display::new().context("Failed to create the Wayland display")?;
    protocol::create_globals(&display.handle(), dmabuf);

    let listening = match &config.wayland.socket {
        Some(name) => ListeningSocket::bind(name)
            .with_context(|| format!("Failed to bind socket {}", name))?,
        None => ListeningSocket::bind_auto("wayland", 1..32).context("Failed to bind socket")?,
    };
    let socket_name = listening
        .socket_name()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("missing socket name"))?;
    std::env::set_var("WAYLAND_DISPLAY", &socket_name);
    info!("📡 Listening on WAYLAND_DISPLAY={}", socket_name);

    let mut state = CompositorState::new(
        Box::new(textures),
        output_info,
        config.output.fullscreen,
        &config.input.seat,
        &config.keyboard,
    );

    let mut event_loop: EventLoop<CompositorState> =
        EventLoop::try_new().context("Failed to create the event loop")?;
    let handle = event_loop.handle();

    let mut dh = display.handle();
    handle
        .insert_source(
            Generic::new(listening, Interest::READ, Mode::Level),
            move |_, listener, state: &mut CompositorState| {
                let listener = unsafe { listener.get_mut() };
                loop {
                    match listener.accept() {
                        Ok(Some(stream)) => {
                            if let Err(e) = dh.insert_client(stream, state.client_state()) {
                                warn!("Failed to add client: {}", e);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            break;
                        }
                    }
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|_| anyhow::anyhow!("register listening socket"))?;

    // Readiness only wakes the loop; the scheduler does the dispatching
    let poll_fd = display
        .backend()
        .poll_fd()
        .try_clone_to_owned()
        .context("Failed to duplicate the display fd")?;
    handle
        .insert_source(
            Generic::new(poll_fd, Interest::READ, Mode::Level),
            |_, _, _: &mut CompositorState| Ok(PostAction::Continue),
        )
        .map_err(|_| anyhow::anyhow!("register display fd"))?;

    let (sender, events): (channel::Sender<InputEvent>, Channel<InputEvent>) = channel::channel();
    handle
        .insert_source(events, |event, _, state: &mut CompositorState| {
            if let channel::Event::Msg(event) = event {
                state.handle_input(event);
            }
        })
        .map_err(|_| anyhow::anyhow!("register input channel"))?;

    let _input = match InputRouter::spawn(&config.input, (width, height), sender) {
        Ok(router) => Some(router),
        Err(e) => {
            warn!("Input disabled: {:#}", e);
            None
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        let signal = event_loop.get_signal();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
            signal.wakeup();
        })
        .context("Failed to install the signal handler")?;
    }

    info!("✅ kmsbox running at {}x{}", width, height);
    while running.load(Ordering::SeqCst) {
        let timeout = scheduler.needs_redraw().then_some(RETRY_INTERVAL);
        event_loop
            .dispatch(timeout, &mut state)
            .context("Event loop failed")?;
        scheduler.tick(&mut display, &mut state)?;
    }

    info!("👋 Shutting down after {} frames", scheduler.frames());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyboardConfig;
    use crate::drm::DrmError;
    use crate::pipeline::headless::HeadlessBackend;
    use crate::pipeline::TextureId;
    use crate::render::Rect;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakePresenter {
        frames: Vec<Vec<(TextureId, Rect)>>,
        current: Vec<(TextureId, Rect)>,
        /// Results handed out by `swap`, then `Presented` forever
        script: VecDeque<Result<(), DrmError>>,
    }

    impl Presenter for FakePresenter {
        fn size(&self) -> (u32, u32) {
            (800, 600)
        }

        fn begin_frame(&mut self) {
            self.current.clear();
        }

        fn draw_texture(&mut self, texture: TextureId, dst: Rect, _flip_y: bool) {
            self.current.push((texture, dst));
        }

        fn swap(&mut self, _vsync: bool) -> Result<SwapStatus> {
            let result = self.script.pop_front().unwrap_or(Ok(()));
            let status = SwapStatus::from_present(result)?;
            if status == SwapStatus::Presented {
                self.frames.push(std::mem::take(&mut self.current));
            }
            Ok(status)
        }
    }

    fn setup() -> (Display<CompositorState>, CompositorState) {
        let display = Display::new().unwrap();
        let state = CompositorState::new(
            Box::new(HeadlessBackend::immediate()),
            OutputInfo::new(800, 600, 60),
            false,
            "seat0",
            &KeyboardConfig::default(),
        );
        (display, state)
    }

    #[test]
    fn first_tick_clears_the_output_once() {
        let (mut display, mut state) = setup();
        let mut scheduler = FrameScheduler::new(FakePresenter::default(), false);

        scheduler.tick(&mut display, &mut state).unwrap();
        scheduler.tick(&mut display, &mut state).unwrap();

        assert_eq!(scheduler.presenter().frames.len(), 1);
        assert!(scheduler.presenter().frames[0].is_empty());
        assert!(!scheduler.needs_redraw());
    }

    #[test]
    fn busy_display_is_retried_next_tick() {
        let (mut display, mut state) = setup();
        let presenter = FakePresenter {
            script: VecDeque::from([Err(DrmError::Busy)]),
            ..FakePresenter::default()
        };
        let mut scheduler = FrameScheduler::new(presenter, false);

        scheduler.tick(&mut display, &mut state).unwrap();
        assert!(scheduler.needs_redraw());
        assert_eq!(scheduler.frames(), 0);

        scheduler.tick(&mut display, &mut state).unwrap();
        assert!(!scheduler.needs_redraw());
        assert_eq!(scheduler.frames(), 1);
    }

    #[test]
    fn failed_modeset_stops_the_scheduler() {
        let (mut display, mut state) = setup();
        let presenter = FakePresenter {
            script: VecDeque::from([Err(DrmError::Modeset(std::io::Error::from_raw_os_error(
                libc::EINVAL,
            )))]),
            ..FakePresenter::default()
        };
        let mut scheduler = FrameScheduler::new(presenter, false);

        let err = scheduler.tick(&mut display, &mut state).unwrap_err();
        assert!(format!("{:#}", err).contains("mode set failed"));
        assert_eq!(scheduler.frames(), 0);
    }

    #[test]
    fn failed_flip_drops_only_that_frame() {
        let (mut display, mut state) = setup();
        let presenter = FakePresenter {
            script: VecDeque::from([Err(DrmError::PageFlip(std::io::Error::from_raw_os_error(
                libc::EINVAL,
            )))]),
            ..FakePresenter::default()
        };
        let mut scheduler = FrameScheduler::new(presenter, false);

        scheduler.tick(&mut display, &mut state).unwrap();
        assert_eq!(scheduler.frames(), 0);
        assert!(scheduler.presenter().frames.is_empty());
    }
}
