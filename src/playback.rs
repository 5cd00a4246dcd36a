//! Ordered playback of synthesized audio.
//!
//! [`PlaybackQueue`] is a strict FIFO with a single active stream: starting a
//! new item always stops the previous one, and natural completion advances
//! the queue automatically. Speaking transitions are published on a `watch`
//! channel for the avatar renderer, which owns its own animation loop and
//! consumes nothing else.

use crate::error::{Result, SessionError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

/// One synthesized utterance awaiting playback.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    /// Opaque audio payload (mp3 from the synthesis service).
    pub audio: Bytes,
    /// Playback rate; >1.0 is faster than recorded.
    pub rate: f32,
}

/// Seam between the queue and the audio device.
///
/// `start` must not block; the returned receiver resolves when the item ends
/// naturally. A stopped item never resolves its receiver.
pub trait AudioSink: Send {
    /// Begin playing an item, stopping any active one first.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio device rejects the stream.
    fn start(&mut self, item: &PlaybackItem) -> Result<oneshot::Receiver<()>>;

    /// Stop the active stream, if any.
    fn stop(&mut self);
}

/// Strictly ordered, single-consumer playback queue.
pub struct PlaybackQueue {
    queue: VecDeque<PlaybackItem>,
    sink: Box<dyn AudioSink>,
    speaking: watch::Sender<bool>,
    finished_tx: mpsc::UnboundedSender<u64>,
    /// Generation of the currently playing item; stale completion events
    /// (from items stopped mid-play) are ignored by comparing against this.
    current_gen: u64,
    is_speaking: bool,
}

impl PlaybackQueue {
    /// Create a queue over the given sink.
    ///
    /// Returns the queue, the completion event stream (feed events back into
    /// [`PlaybackQueue::handle_finished`]), and the speaking watch channel.
    pub fn new(
        sink: Box<dyn AudioSink>,
    ) -> (Self, mpsc::UnboundedReceiver<u64>, watch::Receiver<bool>) {
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        (
            Self {
                queue: VecDeque::new(),
                sink,
                speaking: speaking_tx,
                finished_tx,
                current_gen: 0,
                is_speaking: false,
            },
            finished_rx,
            speaking_rx,
        )
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Append an item. Playback starts only when the queue is idle.
    pub fn enqueue(&mut self, item: PlaybackItem) {
        self.queue.push_back(item);
        if !self.is_speaking {
            self.play_next(false);
        }
    }

    /// Start the next queued item.
    ///
    /// While something is speaking and `force_end` is false this is a no-op;
    /// with `force_end` the active item is cut off first.
    pub fn play_next(&mut self, force_end: bool) {
        if self.is_speaking && !force_end {
            return;
        }
        // Starting a new item always stops the previous audio first.
        self.sink.stop();
        self.set_speaking(false);

        let Some(item) = self.queue.pop_front() else {
            return;
        };

        self.current_gen += 1;
        let generation = self.current_gen;
        match self.sink.start(&item) {
            Ok(done) => {
                self.set_speaking(true);
                let finished_tx = self.finished_tx.clone();
                tokio::spawn(async move {
                    // Ended, failed, or stopped, the item is over either
                    // way; stopped items carry a stale generation and are
                    // filtered in handle_finished.
                    let _ = done.await;
                    let _ = finished_tx.send(generation);
                });
            }
            Err(e) => {
                // Skip the unplayable item and keep draining.
                error!("playback failed, skipping item: {e}");
                self.play_next(false);
            }
        }
    }

    /// Process a completion event from the sink. Stale generations are
    /// ignored; a current one flips speaking off and advances the queue.
    pub fn handle_finished(&mut self, generation: u64) {
        if generation != self.current_gen {
            debug!("ignoring stale playback completion (gen {generation})");
            return;
        }
        self.set_speaking(false);
        self.play_next(false);
    }

    /// Stop the active item and drop everything queued.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.sink.stop();
        self.current_gen += 1;
        self.set_speaking(false);
    }

    fn set_speaking(&mut self, value: bool) {
        if self.is_speaking != value {
            self.is_speaking = value;
            let _ = self.speaking.send(value);
        }
    }
}

// ---------------------------------------------------------------------------
// cpal sink
// ---------------------------------------------------------------------------

/// Audio output to the system speakers via cpal.
///
/// Each item is decoded (mp3 → f32 samples) and played on a dedicated
/// thread; the playback rate is applied by scaling the output sample rate.
pub struct CpalSink {
    stop_flag: Option<Arc<AtomicBool>>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self { stop_flag: None }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalSink {
    fn start(&mut self, item: &PlaybackItem) -> Result<oneshot::Receiver<()>> {
        self.stop();

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Some(Arc::clone(&stop_flag));

        let (done_tx, done_rx) = oneshot::channel();
        let audio = item.audio.clone();
        let rate = item.rate;

        std::thread::spawn(move || {
            if let Err(e) = play_blocking(&audio, rate, &stop_flag) {
                warn!("audio playback error: {e}");
            }
            // A failed item resolves too so the queue can advance; only a
            // stop leaves the channel unresolved.
            if !stop_flag.load(Ordering::Relaxed) {
                let _ = done_tx.send(());
            }
        });

        Ok(done_rx)
    }

    fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// Decode and play an utterance, returning when it ends or the flag is set.
fn play_blocking(audio: &Bytes, rate: f32, stop_flag: &Arc<AtomicBool>) -> Result<()> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let (samples, sample_rate) = decode_mp3(audio)?;

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SessionError::Playback("no default output device".into()))?;

    let stream_config = cpal::StreamConfig {
        channels: 1,
        // Scaling the device rate plays the samples faster or slower.
        sample_rate: (sample_rate as f32 * rate) as u32,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(std::sync::Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                for sample in data.iter_mut() {
                    if buf.position < buf.samples.len() {
                        *sample = buf.samples[buf.position];
                        buf.position += 1;
                    } else {
                        *sample = 0.0;
                        buf.finished = true;
                    }
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SessionError::Playback(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SessionError::Playback(format!("failed to start output stream: {e}")))?;

    loop {
        std::thread::sleep(std::time::Duration::from_millis(10));
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let buf = buffer
            .lock()
            .map_err(|e| SessionError::Playback(format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Internal buffer for tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

/// Decode an mp3 payload to mono f32 samples.
fn decode_mp3(audio: &Bytes) -> Result<(Vec<f32>, u32)> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let cursor = std::io::Cursor::new(audio.to_vec());
    let stream = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| SessionError::Playback(format!("cannot probe audio: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| SessionError::Playback("no audio track in payload".into()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| SessionError::Playback("unknown sample rate".into()))?;
    let channels = track.codec_params.channels.map_or(1, |c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| SessionError::Playback(format!("cannot create decoder: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(_)) => break,
            Err(e) => return Err(SessionError::Playback(format!("decode error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
            Err(e) => return Err(SessionError::Playback(format!("decode error: {e}"))),
        };
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buf.copy_interleaved_ref(decoded);
        if channels <= 1 {
            samples.extend_from_slice(buf.samples());
        } else {
            // Downmix to mono.
            samples.extend(
                buf.samples()
                    .chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    Ok((samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted sink: records starts/stops, completes items on demand.
    struct StubSink {
        started: Arc<Mutex<Vec<PlaybackItem>>>,
        stops: Arc<Mutex<usize>>,
        pending: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    }

    impl StubSink {
        fn new() -> (
            Self,
            Arc<Mutex<Vec<PlaybackItem>>>,
            Arc<Mutex<usize>>,
            Arc<Mutex<Option<oneshot::Sender<()>>>>,
        ) {
            let started = Arc::new(Mutex::new(Vec::new()));
            let stops = Arc::new(Mutex::new(0));
            let pending = Arc::new(Mutex::new(None));
            (
                Self {
                    started: Arc::clone(&started),
                    stops: Arc::clone(&stops),
                    pending: Arc::clone(&pending),
                },
                started,
                stops,
                pending,
            )
        }
    }

    impl AudioSink for StubSink {
        fn start(&mut self, item: &PlaybackItem) -> Result<oneshot::Receiver<()>> {
            let (tx, rx) = oneshot::channel();
            self.started.lock().unwrap().push(item.clone());
            *self.pending.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        fn stop(&mut self) {
            *self.stops.lock().unwrap() += 1;
            // Dropping the sender cancels the completion.
            self.pending.lock().unwrap().take();
        }
    }

    fn item(tag: &str) -> PlaybackItem {
        PlaybackItem {
            audio: Bytes::from(tag.as_bytes().to_vec()),
            rate: 1.0,
        }
    }

    /// Let the pending item finish "naturally" and feed the completion back.
    async fn finish_current(
        pending: &Arc<Mutex<Option<oneshot::Sender<()>>>>,
        finished_rx: &mut mpsc::UnboundedReceiver<u64>,
        queue: &mut PlaybackQueue,
    ) {
        let tx = pending.lock().unwrap().take().expect("an item is playing");
        tx.send(()).unwrap();
        let generation = finished_rx.recv().await.expect("completion event");
        queue.handle_finished(generation);
    }

    #[tokio::test]
    async fn playback_order_equals_enqueue_order() {
        let (sink, started, _stops, pending) = StubSink::new();
        let (mut queue, mut finished_rx, _speaking) = PlaybackQueue::new(Box::new(sink));

        queue.enqueue(item("one"));
        queue.enqueue(item("two"));
        queue.enqueue(item("three"));

        // Only the first item started; at most one plays at a time.
        assert_eq!(started.lock().unwrap().len(), 1);
        assert!(queue.is_speaking());
        assert_eq!(queue.queued_len(), 2);

        finish_current(&pending, &mut finished_rx, &mut queue).await;
        finish_current(&pending, &mut finished_rx, &mut queue).await;
        finish_current(&pending, &mut finished_rx, &mut queue).await;

        let order: Vec<String> = started
            .lock()
            .unwrap()
            .iter()
            .map(|i| String::from_utf8_lossy(&i.audio).to_string())
            .collect();
        assert_eq!(order, vec!["one", "two", "three"]);
        assert!(!queue.is_speaking());
    }

    #[tokio::test]
    async fn enqueue_while_speaking_only_appends() {
        let (sink, started, _stops, _pending) = StubSink::new();
        let (mut queue, _finished_rx, _speaking) = PlaybackQueue::new(Box::new(sink));

        queue.enqueue(item("a"));
        queue.enqueue(item("b"));
        assert_eq!(started.lock().unwrap().len(), 1);
        assert_eq!(queue.queued_len(), 1);
    }

    #[tokio::test]
    async fn play_next_without_force_is_noop_while_speaking() {
        let (sink, started, _stops, _pending) = StubSink::new();
        let (mut queue, _finished_rx, _speaking) = PlaybackQueue::new(Box::new(sink));

        queue.enqueue(item("a"));
        queue.enqueue(item("b"));
        queue.play_next(false);
        assert_eq!(started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn force_end_preempts_the_active_item() {
        let (sink, started, stops, _pending) = StubSink::new();
        let (mut queue, _finished_rx, _speaking) = PlaybackQueue::new(Box::new(sink));

        queue.enqueue(item("a"));
        queue.enqueue(item("b"));
        queue.play_next(true);

        assert_eq!(started.lock().unwrap().len(), 2);
        assert!(*stops.lock().unwrap() >= 1);
        assert!(queue.is_speaking());
    }

    #[tokio::test]
    async fn stale_completion_does_not_advance() {
        let (sink, started, _stops, pending) = StubSink::new();
        let (mut queue, mut finished_rx, _speaking) = PlaybackQueue::new(Box::new(sink));

        queue.enqueue(item("a"));
        queue.enqueue(item("b"));

        // Preempt "a", then let its (stale) completion arrive anyway.
        let stale_tx = pending.lock().unwrap().take().unwrap();
        queue.play_next(true); // starts "b", gen bumped
        let _ = stale_tx.send(());
        if let Ok(generation) = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            finished_rx.recv(),
        )
        .await
        {
            queue.handle_finished(generation.unwrap());
        }

        // "b" is still the active item; nothing advanced past it.
        assert_eq!(started.lock().unwrap().len(), 2);
        assert!(queue.is_speaking());
    }

    #[tokio::test]
    async fn async_failure_still_advances_the_queue() {
        let (sink, started, _stops, pending) = StubSink::new();
        let (mut queue, mut finished_rx, speaking) = PlaybackQueue::new(Box::new(sink));

        queue.enqueue(item("a"));
        queue.enqueue(item("b"));

        // The sink dies mid-item: its completion sender drops unsent.
        drop(pending.lock().unwrap().take());
        let generation = finished_rx.recv().await.expect("completion event");
        queue.handle_finished(generation);

        // "b" plays; the dead item did not wedge the queue.
        assert_eq!(started.lock().unwrap().len(), 2);
        assert!(queue.is_speaking());
        assert!(*speaking.borrow());
    }

    #[tokio::test]
    async fn clear_stops_and_drops_everything() {
        let (sink, _started, stops, _pending) = StubSink::new();
        let (mut queue, _finished_rx, speaking) = PlaybackQueue::new(Box::new(sink));

        queue.enqueue(item("a"));
        queue.enqueue(item("b"));
        queue.clear();

        assert!(!queue.is_speaking());
        assert_eq!(queue.queued_len(), 0);
        assert!(*stops.lock().unwrap() >= 1);
        assert!(!*speaking.borrow());
    }

    #[tokio::test]
    async fn speaking_watch_tracks_transitions() {
        let (sink, _started, _stops, pending) = StubSink::new();
        let (mut queue, mut finished_rx, speaking) = PlaybackQueue::new(Box::new(sink));

        assert!(!*speaking.borrow());
        queue.enqueue(item("a"));
        assert!(*speaking.borrow());
        finish_current(&pending, &mut finished_rx, &mut queue).await;
        assert!(!*speaking.borrow());
    }
}
