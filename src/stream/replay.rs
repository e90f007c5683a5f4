//! Replay of a captured stream.

use super::frame::LiveStream;
use crate::store::record::ResponseSnapshot;

/// Emit the captured frames in sequence order followed by the terminal
/// frame, back to back.
///
/// A single-value snapshot replays as an empty stream.
pub fn replay_stream(snapshot: &ResponseSnapshot) -> LiveStream {
    Box::pin(tokio_stream::iter(snapshot.replay_frames()))
}
