//! Live voice assistant: microphone → remote model → speaker, with tool
//! calls that act on the local agenda and ledger.

pub mod capture;
pub mod codec;
pub mod playback;
pub mod session;
pub mod tools;
pub mod transport;

pub use session::{VoiceHandle, VoiceSessionManager, VoiceState, VoiceStatus};
pub use tools::ToolHost;
