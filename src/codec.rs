use crate::{
    context::CodecContext,
    frame::{Frame, Packet},
    worker::DecodeScope,
};

/// Capability flags a back-end declares up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecCaps {
    /// The back-end buffers frames internally; empty packets must still be
    /// submitted so it can drain.
    pub delay: bool,
    /// The pipeline attaches a per-frame progress channel in `get_buffer`.
    pub allocate_progress: bool,
    /// The back-end implements [`Codec::update_thread_context`] and calls
    /// [`DecodeScope::finish_setup`] itself. Without this the pipeline
    /// declares setup complete before the decode call.
    pub update_thread_context: bool,
    /// Extra reference latency: shortens the priming window by this many
    /// packets for back-ends that need one less frame in flight.
    pub priming_latency: usize,
}

/// A pluggable decoding back-end.
///
/// The pipeline creates one [`Codec::Decoder`] per worker. During
/// [`Codec::decode`] the back-end may call back into the pipeline through the
/// [`DecodeScope`]: request an output buffer, negotiate a pixel format,
/// report or await row progress, and declare its setup complete.
///
/// [`Codec::Shared`] is the reference state one worker hands to the next: the
/// back-end passes it to [`DecodeScope::finish_setup`] and receives it in
/// [`Codec::update_thread_context`] when the next submission primes its
/// decoder.
pub trait Codec: Sized + Send + Sync + 'static {
    type Decoder: Send + 'static;
    type Shared: Send + Default + 'static;

    fn caps(&self) -> CodecCaps;

    /// Create the private decoder instance for one worker. Failing here
    /// unwinds the partially built pipeline; the back-end cleans up its own
    /// partial state before returning.
    fn open(&self, ctx: &CodecContext) -> anyhow::Result<Self::Decoder>;

    /// Decode one packet. `Ok(true)` means a frame was produced into
    /// `frame`; errors are latched and surfaced to the caller when this
    /// worker's turn to be harvested arrives.
    fn decode(
        &self,
        decoder: &mut Self::Decoder,
        cx: &mut DecodeScope<'_, Self>,
        frame: &mut Frame,
        packet: &Packet,
    ) -> anyhow::Result<bool>;

    /// Prime `dst` with the reference state the previous worker published at
    /// setup-complete. Only called when `caps().update_thread_context`.
    fn update_thread_context(
        &self,
        _dst: &mut Self::Decoder,
        _src: &Self::Shared,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn flush(&self, _decoder: &mut Self::Decoder) {}

    fn close(&self, _decoder: &mut Self::Decoder) {}
}
