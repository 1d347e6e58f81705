//! Native audio decode path built on `symphonia`, driving the same crate
//! per packet. Video and subtitle tracks have no equivalent native path in
//! this dependency stack; those always go through a host-supplied
//! [`super::Decoder`] or the Fallback Transcoder.

use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet as SymphoniaPacket;

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::model::AudioSamples;

use super::{Decoder, DecodedUnit, Packet};

pub struct SymphoniaAudioDecoder {
    inner: Box<dyn symphonia::core::codecs::Decoder>,
    sample_buffer: Option<SampleBuffer<f32>>,
    channel_count: u16,
    sample_rate: u32,
}

impl SymphoniaAudioDecoder {
    pub fn new(codec_params: &CodecParameters) -> EngineResult<Self> {
        let inner = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|err| EngineError::new(ErrorKind::DecodeError, err.to_string()))?;
        let channel_count = codec_params.channels.map_or(2, |channels| channels.count() as u16);
        let sample_rate = codec_params.sample_rate.unwrap_or(48_000);
        Ok(Self { inner, sample_buffer: None, channel_count, sample_rate })
    }

    fn ensure_sample_buffer(&mut self, decoded: &AudioBufferRef<'_>) {
        if self.sample_buffer.is_none() {
            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            self.sample_buffer = Some(SampleBuffer::new(capacity, spec));
        }
    }
}

impl Decoder for SymphoniaAudioDecoder {
    fn decode(&mut self, packet: Packet) -> EngineResult<Vec<DecodedUnit>> {
        let pts_samples = (packet.pts * self.sample_rate as f64).round() as u64;
        let symphonia_packet = SymphoniaPacket::new_from_slice(0, pts_samples, 0, &packet.data);
        match self.inner.decode(&symphonia_packet) {
            Ok(decoded) => {
                self.ensure_sample_buffer(&decoded);
                let buffer = self.sample_buffer.as_mut().expect("just ensured");
                buffer.copy_interleaved_ref(decoded);
                let data = buffer.samples().to_vec();
                let frame_count = data.len() / self.channel_count.max(1) as usize;
                let chunk_duration = frame_count as f64 / self.sample_rate as f64;
                Ok(vec![DecodedUnit::Audio(AudioSamples::new(
                    self.channel_count,
                    self.sample_rate,
                    packet.pts,
                    chunk_duration,
                    data,
                ))])
            }
            Err(SymphoniaError::DecodeError(message)) => {
                Err(EngineError::new(ErrorKind::DecodeError, message))
            }
            Err(err) => Err(EngineError::new(ErrorKind::DecodeError, err.to_string())),
        }
    }

    fn flush(&mut self) -> Vec<DecodedUnit> {
        Vec::new()
    }
}
