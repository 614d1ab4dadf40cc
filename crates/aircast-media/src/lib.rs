// crates/aircast-media/src/lib.rs
//
// Media layer of the aircast playout engine: decode (file producer), the
// slot-gated look-ahead buffers, the house encoder, MPEG-TS muxing and
// socket egress. Everything that touches ffmpeg or a socket lives here.

pub mod egress;
pub mod encoder;
pub mod frame;
pub mod lookahead;
pub mod pad;
pub mod producer;
pub mod sink;
pub mod ts;

pub use egress::{ByteSink, EgressSet, NullSink, SocketEgress};
pub use encoder::{EncodedPacket, HouseEncoder, StreamKind};
pub use frame::{HouseAudioFrame, HouseVideoFrame};
pub use lookahead::{BlockBuffers, FillQueues, FrameProducer, FrameQueue, Retired, SampleQueue};
pub use pad::PadSource;
pub use producer::FileProducer;
pub use sink::{SinkFrame, SinkOffer, TsSink};
