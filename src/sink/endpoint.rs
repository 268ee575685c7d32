//! Negotiable input endpoint that accepts pushed MJPEG frames
//!
//! Negotiation (enumerate, accept-test, connect, disconnect) happens from the
//! orchestrator before streaming starts. Once connected, the upstream peer
//! calls `receive` once per frame from its own thread. The connection state is
//! published through an `ArcSwap`, so the hot path reads it without locking and
//! only touches the pool's mutex to hand the filled buffer over.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::atomic::AtomicCell;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::{FormatDescriptor, FormatEnumerator, Frame, SampleMetadata, SubType};
use crate::error::{SinkError, SinkResult};
use crate::pipeline::{BufferPool, FrameBuffer};

/// Identifier every sink endpoint answers to
pub const INPUT_PIN_ID: &str = "input";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

/// Upstream connection partner
pub trait Peer: Send + Sync {
    fn name(&self) -> &str;

    fn direction(&self) -> PinDirection {
        PinDirection::Output
    }
}

pub type PeerRef = Arc<dyn Peer>;

#[derive(Clone, Default)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Connected {
        peer: PeerRef,
        format: FormatDescriptor,
    },
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => write!(f, "Unconnected"),
            Self::Connected { peer, format } => f
                .debug_struct("Connected")
                .field("peer", &peer.name())
                .field("format", format)
                .finish(),
        }
    }
}

/// Buffer requirements for the optional allocator capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorProperties {
    pub buffers: u32,
    pub buffer_size: u32,
    pub alignment: u32,
    pub prefix: u32,
}

/// Snapshot describing an endpoint to its peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinInfo {
    pub id: String,
    pub owner: String,
    pub direction: PinDirection,
}

pub struct SinkEndpoint {
    owner: ArcSwap<String>,
    formats: Arc<[FormatDescriptor]>,
    state: ArcSwap<ConnectionState>,
    pool: Arc<BufferPool>,
    sequence: AtomicU64,
    one_shot: AtomicCell<Option<u32>>,
    end_of_stream: AtomicBool,
    allocator: Option<AllocatorProperties>,
    upstream_allocator: ArcSwapOption<(AllocatorProperties, bool)>,
}

impl SinkEndpoint {
    /// Endpoint accepting `formats`, handing frames to `pool`
    pub fn new(owner: &str, formats: Vec<FormatDescriptor>, pool: Arc<BufferPool>) -> Self {
        if formats.is_empty() {
            warn!(owner, "sink endpoint created with no accepted formats");
        }

        Self {
            owner: ArcSwap::from_pointee(owner.to_string()),
            formats: Arc::from(formats),
            state: ArcSwap::from_pointee(ConnectionState::Unconnected),
            pool,
            sequence: AtomicU64::new(0),
            one_shot: AtomicCell::new(None),
            end_of_stream: AtomicBool::new(false),
            allocator: None,
            upstream_allocator: ArcSwapOption::empty(),
        }
    }

    /// Offer an allocator with these properties to upstream peers
    pub fn with_allocator(mut self, properties: AllocatorProperties) -> Self {
        self.allocator = Some(properties);
        self
    }

    pub fn id(&self) -> &str {
        INPUT_PIN_ID
    }

    pub fn direction(&self) -> PinDirection {
        PinDirection::Input
    }

    pub fn info(&self) -> PinInfo {
        PinInfo {
            id: INPUT_PIN_ID.to_string(),
            owner: self.owner.load().as_ref().clone(),
            direction: PinDirection::Input,
        }
    }

    pub(crate) fn set_owner(&self, owner: &str) {
        self.owner.store(Arc::new(owner.to_string()));
    }

    /// Fresh cursor over every format this endpoint accepts
    pub fn enumerate_formats(&self) -> FormatEnumerator {
        FormatEnumerator::new(Arc::clone(&self.formats))
    }

    /// True if `format` matches an accepted major type and its subtype is
    /// either the accepted one or the unspecified wildcard
    pub fn accepts(&self, format: &FormatDescriptor) -> bool {
        self.resolve(format).is_some()
    }

    /// The accepted descriptor `format` negotiates to, if any
    fn resolve(&self, format: &FormatDescriptor) -> Option<FormatDescriptor> {
        self.formats
            .iter()
            .find(|accepted| {
                accepted.major == format.major
                    && (format.subtype == accepted.subtype
                        || format.subtype == SubType::Unspecified)
            })
            .copied()
    }

    /// Connect to `peer` with `format`.
    ///
    /// Reconnecting the current peer with an accepted format succeeds and
    /// renegotiates the format. A wildcard subtype is resolved to the first
    /// matching accepted format.
    #[instrument(skip(self, peer), fields(peer = peer.name()))]
    pub fn connect(&self, peer: PeerRef, format: &FormatDescriptor) -> SinkResult<()> {
        if let ConnectionState::Connected { peer: current, .. } = self.state.load().as_ref() {
            if !Arc::ptr_eq(current, &peer) {
                warn!(current = current.name(), "connect refused, already connected");
                return Err(SinkError::AlreadyConnected);
            }
        }

        let Some(negotiated) = self.resolve(format) else {
            debug!(%format, "format rejected");
            return Err(SinkError::FormatRejected(*format));
        };

        self.end_of_stream.store(false, Ordering::Relaxed);
        self.state.store(Arc::new(ConnectionState::Connected {
            peer,
            format: negotiated,
        }));
        info!(format = %negotiated, "sink endpoint connected");
        Ok(())
    }

    /// Drop the peer. No-op when already unconnected.
    pub fn disconnect(&self) {
        let previous = self.state.swap(Arc::new(ConnectionState::Unconnected));
        if let ConnectionState::Connected { peer, .. } = previous.as_ref() {
            info!(peer = peer.name(), "sink endpoint disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state.load().as_ref(), ConnectionState::Connected { .. })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.load().as_ref().clone()
    }

    pub fn current_peer(&self) -> SinkResult<PeerRef> {
        match self.state.load().as_ref() {
            ConnectionState::Connected { peer, .. } => Ok(Arc::clone(peer)),
            ConnectionState::Unconnected => Err(SinkError::NotConnected),
        }
    }

    /// Format negotiated with the current peer
    pub fn connection_format(&self) -> SinkResult<FormatDescriptor> {
        match self.state.load().as_ref() {
            ConnectionState::Connected { format, .. } => Ok(*format),
            ConnectionState::Unconnected => Err(SinkError::NotConnected),
        }
    }

    /// `receive` hands off to the writer and never waits on disk
    pub fn receive_can_block(&self) -> bool {
        false
    }

    /// Tag the next received frame as the answer to one-shot request `tag`
    pub fn arm_one_shot(&self, tag: u32) {
        if let Some(previous) = self.one_shot.swap(Some(tag)) {
            debug!(previous, tag, "one-shot request replaced before a frame arrived");
        }
    }

    /// Copy one frame into a pool buffer and queue it for writing
    pub fn receive(&self, payload: &[u8], meta: &SampleMetadata) -> SinkResult<()> {
        self.check_push(payload)?;

        let mut buffer = self.pool.get_buffer();
        self.fill(&mut buffer, payload, meta);
        self.pool.save(buffer);
        Ok(())
    }

    pub fn push(&self, frame: &Frame) -> SinkResult<()> {
        self.receive(&frame.data, &frame.meta)
    }

    /// Push a batch of frames, stopping at the first one that fails.
    ///
    /// Returns how many frames were queued.
    pub fn receive_multiple(&self, frames: &[Frame]) -> SinkResult<usize> {
        let Some((first, rest)) = frames.split_first() else {
            return Ok(0);
        };
        self.check_push(&first.data)?;

        let mut buffer = self.pool.get_buffer();
        self.fill(&mut buffer, &first.data, &first.meta);
        for frame in rest {
            if let Err(e) = self.check_push(&frame.data) {
                self.pool.save(buffer);
                return Err(e);
            }
            // queue the filled buffer and pick up the next one in one lock
            self.pool.save_and_get_buffer(&mut buffer);
            self.fill(&mut buffer, &frame.data, &frame.meta);
        }
        self.pool.save(buffer);
        Ok(frames.len())
    }

    /// Upstream has no more frames for this connection
    pub fn end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Relaxed);
        info!(frames = self.sequence.load(Ordering::Relaxed), "end of stream");
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Relaxed)
    }

    /// Properties of the allocator this endpoint offers, if it offers one
    pub fn allocator_requirements(&self) -> SinkResult<AllocatorProperties> {
        self.allocator.ok_or(SinkError::NoAllocator)
    }

    /// Record the allocator the upstream peer settled on.
    ///
    /// Frames are always copied into pool buffers, so this is bookkeeping only.
    pub fn notify_allocator(&self, properties: AllocatorProperties, read_only: bool) {
        debug!(?properties, read_only, "upstream allocator");
        self.upstream_allocator
            .store(Some(Arc::new((properties, read_only))));
    }

    pub fn upstream_allocator(&self) -> Option<(AllocatorProperties, bool)> {
        self.upstream_allocator.load().as_deref().copied()
    }

    fn check_push(&self, payload: &[u8]) -> SinkResult<()> {
        if !self.is_connected() {
            metrics::counter!("grabber_frames_rejected_total").increment(1);
            return Err(SinkError::NotConnected);
        }
        if payload.is_empty() {
            metrics::counter!("grabber_frames_rejected_total").increment(1);
            return Err(SinkError::NullArgument);
        }
        Ok(())
    }

    fn fill(&self, buffer: &mut FrameBuffer, payload: &[u8], meta: &SampleMetadata) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let one_shot = self.one_shot.swap(None);
        buffer.store(payload);
        buffer.stamp(meta, sequence, one_shot);
        metrics::counter!("grabber_frames_received_total").increment(1);
        trace!(sequence, bytes = payload.len(), camera = meta.camera, "frame received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MajorType;
    use crate::pipeline::ShutdownPolicy;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::sync::Mutex;

    struct TestPeer(&'static str);

    impl Peer for TestPeer {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn peer(name: &'static str) -> PeerRef {
        Arc::new(TestPeer(name))
    }

    type Written = Arc<Mutex<Vec<(u64, Option<u32>, Vec<u8>)>>>;

    fn endpoint() -> (SinkEndpoint, Arc<BufferPool>, Written) {
        let written: Written = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&written);
        let persister = move |b: &FrameBuffer| -> SinkResult<()> {
            sink.lock()
                .unwrap()
                .push((b.sequence, b.one_shot, b.data().to_vec()));
            Ok(())
        };
        let pool = Arc::new(BufferPool::start(Box::new(persister), ShutdownPolicy::Drain).unwrap());
        pool.reserve(2, 64);
        let endpoint = SinkEndpoint::new("grabber", vec![FormatDescriptor::mjpeg()], Arc::clone(&pool));
        (endpoint, pool, written)
    }

    fn any_major() -> impl Strategy<Value = MajorType> {
        prop_oneof![
            Just(MajorType::Video),
            Just(MajorType::Audio),
            Just(MajorType::Text),
            Just(MajorType::Unspecified),
        ]
    }

    fn any_subtype() -> impl Strategy<Value = SubType> {
        prop_oneof![
            Just(SubType::Mjpeg),
            Just(SubType::Yuy2),
            Just(SubType::Rgb24),
            Just(SubType::Nv12),
            Just(SubType::Pcm),
            Just(SubType::Unspecified),
        ]
    }

    proptest! {
        #[test]
        fn test_accepts_only_video_mjpeg_or_wildcard(
            major in any_major(),
            subtype in any_subtype(),
            fixed in any::<bool>(),
            size in 0u32..1_000_000,
        ) {
            let (endpoint, _pool, _) = endpoint();
            let format = FormatDescriptor { major, subtype, fixed_size_samples: fixed, sample_size: size };
            let expected = major == MajorType::Video
                && matches!(subtype, SubType::Mjpeg | SubType::Unspecified);
            prop_assert_eq!(endpoint.accepts(&format), expected);
        }
    }

    #[test]
    fn test_enumerates_configured_formats() {
        let (endpoint, _pool, _) = endpoint();
        let formats: Vec<_> = endpoint.enumerate_formats().collect();
        assert_eq!(formats, vec![FormatDescriptor::mjpeg()]);
        assert!(formats.iter().all(|f| endpoint.accepts(f)));
    }

    #[test]
    fn test_connect_and_disconnect_cycle() {
        let (endpoint, _pool, _) = endpoint();
        assert!(matches!(endpoint.current_peer(), Err(SinkError::NotConnected)));
        assert!(matches!(endpoint.connection_format(), Err(SinkError::NotConnected)));

        assert!(matches!(endpoint.connection_state(), ConnectionState::Unconnected));

        let camera = peer("camera");
        endpoint.connect(Arc::clone(&camera), &FormatDescriptor::mjpeg()).unwrap();
        assert!(endpoint.is_connected());
        assert!(Arc::ptr_eq(&endpoint.current_peer().unwrap(), &camera));
        match endpoint.connection_state() {
            ConnectionState::Connected { peer, format } => {
                assert!(Arc::ptr_eq(&peer, &camera));
                assert_eq!(format, FormatDescriptor::mjpeg());
            }
            ConnectionState::Unconnected => panic!("expected a connection"),
        }

        endpoint.disconnect();
        assert!(!endpoint.is_connected());
        assert!(matches!(endpoint.connection_state(), ConnectionState::Unconnected));
        endpoint.disconnect();

        endpoint.connect(camera, &FormatDescriptor::mjpeg()).unwrap();
        assert!(endpoint.is_connected());
    }

    #[test]
    fn test_second_peer_is_refused() {
        let (endpoint, _pool, _) = endpoint();
        let first = peer("first");
        endpoint.connect(Arc::clone(&first), &FormatDescriptor::mjpeg()).unwrap();

        let err = endpoint.connect(peer("second"), &FormatDescriptor::mjpeg()).unwrap_err();
        assert!(matches!(err, SinkError::AlreadyConnected));
        assert!(Arc::ptr_eq(&endpoint.current_peer().unwrap(), &first));
    }

    #[test]
    fn test_same_peer_reconnects() {
        let (endpoint, _pool, _) = endpoint();
        let camera = peer("camera");
        endpoint.connect(Arc::clone(&camera), &FormatDescriptor::mjpeg()).unwrap();
        endpoint
            .connect(
                Arc::clone(&camera),
                &FormatDescriptor::new(MajorType::Video, SubType::Unspecified),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&endpoint.current_peer().unwrap(), &camera));
        // wildcard resolves to the concrete accepted format
        assert_eq!(endpoint.connection_format().unwrap(), FormatDescriptor::mjpeg());
    }

    #[test]
    fn test_rejected_format_leaves_unconnected() {
        let (endpoint, _pool, _) = endpoint();
        let audio = FormatDescriptor::new(MajorType::Audio, SubType::Pcm);
        let err = endpoint.connect(peer("mic"), &audio).unwrap_err();
        assert!(matches!(err, SinkError::FormatRejected(f) if f == audio));
        assert!(!endpoint.is_connected());
    }

    #[test]
    fn test_receive_without_peer_skips_pool() {
        let (endpoint, pool, _) = endpoint();
        let before = pool.stats();
        let err = endpoint
            .receive(b"\xFF\xD8frame", &SampleMetadata::now(0))
            .unwrap_err();
        assert!(matches!(err, SinkError::NotConnected));
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn test_receive_empty_payload() {
        let (endpoint, pool, _) = endpoint();
        endpoint.connect(peer("camera"), &FormatDescriptor::mjpeg()).unwrap();
        let before = pool.stats();
        let err = endpoint.receive(&[], &SampleMetadata::now(0)).unwrap_err();
        assert!(matches!(err, SinkError::NullArgument));
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn test_receive_queues_copy() {
        let (endpoint, pool, written) = endpoint();
        endpoint.connect(peer("camera"), &FormatDescriptor::mjpeg()).unwrap();
        assert!(!endpoint.receive_can_block());

        let mut payload = b"first".to_vec();
        endpoint.receive(&payload, &SampleMetadata::new(2, Utc::now())).unwrap();
        // the sink owns its copy
        payload.fill(0);
        endpoint.receive(b"second", &SampleMetadata::new(2, Utc::now())).unwrap();
        pool.wait_idle();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], (0, None, b"first".to_vec()));
        assert_eq!(written[1], (1, None, b"second".to_vec()));
    }

    #[test]
    fn test_one_shot_tags_next_frame_only() {
        let (endpoint, pool, written) = endpoint();
        endpoint.connect(peer("camera"), &FormatDescriptor::mjpeg()).unwrap();
        endpoint.arm_one_shot(11);
        endpoint.receive(b"snap", &SampleMetadata::now(0)).unwrap();
        endpoint.receive(b"stream", &SampleMetadata::now(0)).unwrap();
        pool.wait_idle();

        let written = written.lock().unwrap();
        assert_eq!(written[0].1, Some(11));
        assert_eq!(written[1].1, None);
    }

    #[test]
    fn test_receive_multiple_stops_at_bad_frame() {
        let (endpoint, pool, written) = endpoint();
        endpoint.connect(peer("camera"), &FormatDescriptor::mjpeg()).unwrap();
        let meta = SampleMetadata::now(0);
        let good: Vec<Frame> = (1..=4u8).map(|n| Frame::new(vec![n; n as usize], meta)).collect();
        assert_eq!(endpoint.receive_multiple(&good).unwrap(), 4);
        assert_eq!(endpoint.receive_multiple(&[]).unwrap(), 0);

        let mixed = vec![Frame::new(vec![9u8], meta), Frame::new(Vec::<u8>::new(), meta)];
        assert!(matches!(endpoint.receive_multiple(&mixed), Err(SinkError::NullArgument)));
        pool.wait_idle();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 5);
        assert_eq!(written[3].2, vec![4u8; 4]);
        assert_eq!(written[4].2, vec![9u8]);
        let stats = pool.stats();
        assert_eq!(stats.free, stats.allocated);
    }

    #[test]
    fn test_allocator_capability_is_optional() {
        let (endpoint, pool, _) = endpoint();
        assert!(matches!(endpoint.allocator_requirements(), Err(SinkError::NoAllocator)));

        let props = AllocatorProperties {
            buffers: 4,
            buffer_size: 1 << 20,
            alignment: 1,
            prefix: 0,
        };
        let endpoint = SinkEndpoint::new("grabber", vec![FormatDescriptor::mjpeg()], pool)
            .with_allocator(props);
        assert_eq!(endpoint.allocator_requirements().unwrap(), props);

        assert_eq!(endpoint.upstream_allocator(), None);
        endpoint.notify_allocator(props, true);
        assert_eq!(endpoint.upstream_allocator(), Some((props, true)));
    }

    #[test]
    fn test_end_of_stream_resets_on_connect() {
        let (endpoint, _pool, _) = endpoint();
        let camera = peer("camera");
        endpoint.connect(Arc::clone(&camera), &FormatDescriptor::mjpeg()).unwrap();
        endpoint.end_of_stream();
        assert!(endpoint.is_end_of_stream());
        endpoint.disconnect();
        endpoint.connect(camera, &FormatDescriptor::mjpeg()).unwrap();
        assert!(!endpoint.is_end_of_stream());
    }

    #[test]
    fn test_pin_identity() {
        let (endpoint, _pool, _) = endpoint();
        assert_eq!(endpoint.id(), "input");
        assert_eq!(endpoint.direction(), PinDirection::Input);
        assert_eq!(
            endpoint.info(),
            PinInfo {
                id: "input".into(),
                owner: "grabber".into(),
                direction: PinDirection::Input,
            }
        );
    }
}
