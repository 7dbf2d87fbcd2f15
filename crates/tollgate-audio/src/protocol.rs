use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Body of `POST /v1/audio/speech`
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    /// mp3, opus, aac, flac, wav or pcm
    pub response_format: Option<String>,
    pub speed: Option<f64>,
}

impl SpeechRequest {
    /// Content type of the audio the caller receives
    pub fn content_type(&self) -> &'static str {
        match self.response_format.as_deref().unwrap_or("mp3") {
            "opus" => "audio/ogg",
            "aac" => "audio/aac",
            "flac" => "audio/flac",
            "wav" => "audio/wav",
            "pcm" => "audio/pcm",
            _ => "audio/mpeg",
        }
    }
}

/// JSON payload of the frame that opens a synthesis call
#[derive(Debug, Serialize)]
pub struct SynthesisParams<'a> {
    pub model: &'a str,
    pub voice: &'a str,
    pub text: &'a str,
    pub format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl<'a> From<&'a SpeechRequest> for SynthesisParams<'a> {
    fn from(request: &'a SpeechRequest) -> Self {
        Self {
            model: &request.model,
            voice: &request.voice,
            text: &request.input,
            format: request.response_format.as_deref().unwrap_or("mp3"),
            speed: request.speed,
        }
    }
}

/// Parsed multipart body of `POST /v1/audio/transcriptions`
#[derive(Debug, Clone)]
pub struct TranscriptionForm {
    pub audio: Bytes,
    pub filename: String,
    pub content_type: String,
    pub model: String,
    pub language: Option<String>,
    pub prompt: Option<String>,
    /// json or text
    pub response_format: Option<String>,
}

/// JSON payload of the frame that opens a recognition call
#[derive(Debug, Serialize)]
pub struct RecognitionParams<'a> {
    pub model: &'a str,
    pub filename: &'a str,
    pub content_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<&'a str>,
}

impl<'a> From<&'a TranscriptionForm> for RecognitionParams<'a> {
    fn from(form: &'a TranscriptionForm) -> Self {
        Self {
            model: &form.model,
            filename: &form.filename,
            content_type: &form.content_type,
            language: form.language.as_deref(),
            prompt: form.prompt.as_deref(),
        }
    }
}

/// JSON payload of the upstream's recognition result
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub text: String,
    /// Audio length as measured by the upstream
    pub duration_ms: Option<u64>,
}

/// Caller-facing transcription body
#[derive(Debug, Serialize)]
pub struct TranscriptionResponse<'a> {
    pub text: &'a str,
}

/// Duration of a PCM WAV file from its `fmt ` and `data` chunks
pub fn wav_duration_ms(audio: &[u8]) -> Option<u64> {
    if !audio.starts_with(b"RIFF") || audio.get(8..12) != Some(&b"WAVE"[..]) {
        return None;
    }

    let mut byte_rate = None;
    let mut data_len = None;
    let mut offset = 12;

    while let Some(header) = audio.get(offset..offset + 8) {
        let id = &header[..4];
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let body = offset + 8;

        if id == b"fmt " {
            let fmt = audio.get(body..body + 12)?;
            byte_rate = Some(u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]));
        } else if id == b"data" {
            data_len = Some(len);
        }

        if let (Some(rate), Some(len)) = (byte_rate, data_len) {
            if rate == 0 {
                return None;
            }
            return Some(u64::from(len) * 1000 / u64::from(rate));
        }

        // chunks are padded to an even length
        offset = body + usize::try_from(len).ok()? + usize::from(len % 2 == 1);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav(sample_rate: u32, channels: u16, bits: u16, samples: u32) -> Vec<u8> {
        let block_align = channels * bits / 8;
        let byte_rate = sample_rate * u32::from(block_align);
        let data_len = samples * u32::from(block_align);

        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.resize(out.len() + data_len as usize, 0);
        out
    }

    #[test]
    fn wav_duration_from_header() {
        assert_eq!(wav_duration_ms(&wav(16_000, 1, 16, 24_000)), Some(1500));
        assert_eq!(wav_duration_ms(&wav(44_100, 2, 16, 44_100 * 3)), Some(3000));
    }

    #[test]
    fn non_wav_has_no_duration() {
        assert_eq!(wav_duration_ms(b"ID3\x04 not a wav"), None);
        assert_eq!(wav_duration_ms(&wav(16_000, 1, 16, 10)[..20]), None);
    }

    #[test]
    fn speech_content_type_follows_format() {
        let mut request: SpeechRequest =
            serde_json::from_str(r#"{"model":"tts-1","input":"hi","voice":"alloy"}"#).unwrap();
        assert_eq!(request.content_type(), "audio/mpeg");

        request.response_format = Some("wav".to_owned());
        assert_eq!(request.content_type(), "audio/wav");
        assert_eq!(SynthesisParams::from(&request).format, "wav");
    }
}
