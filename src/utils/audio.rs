use anyhow::{anyhow, Result};

/// Parsed WAV payload: the raw fmt chunk plus PCM data bytes. Assembly works
/// directly on these so silence and concatenation stay sample-exact without
/// re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavAudio {
    pub fmt: Vec<u8>,
    pub data: Vec<u8>,
}

impl WavAudio {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
            return Err(anyhow!("not a RIFF/WAVE stream"));
        }

        let mut pos = 12usize;
        let mut fmt: Option<Vec<u8>> = None;
        let mut data: Option<Vec<u8>> = None;

        while pos + 8 <= bytes.len() {
            let id: [u8; 4] = bytes[pos..pos + 4].try_into()?;
            let size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into()?) as usize;
            let body_start = pos + 8;
            let body_end = body_start + size;
            if body_end > bytes.len() {
                return Err(anyhow!(
                    "truncated '{}' chunk",
                    String::from_utf8_lossy(&id)
                ));
            }

            match &id {
                b"fmt " => fmt = Some(bytes[body_start..body_end].to_vec()),
                b"data" => {
                    data = Some(bytes[body_start..body_end].to_vec());
                    break;
                }
                _ => {}
            }
            // RIFF chunks are word-aligned.
            pos = body_end + (size & 1);
        }

        Ok(Self {
            fmt: fmt.ok_or_else(|| anyhow!("missing fmt chunk"))?,
            data: data.ok_or_else(|| anyhow!("missing data chunk"))?,
        })
    }

    /// A zero-length stream sharing this one's format.
    pub fn empty_like(&self) -> Self {
        Self {
            fmt: self.fmt.clone(),
            data: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> Result<u32> {
        self.fmt_u32(4)
    }

    pub fn byte_rate(&self) -> Result<u32> {
        self.fmt_u32(8)
    }

    pub fn block_align(&self) -> Result<u16> {
        self.fmt_u16(12)
    }

    pub fn duration_ms(&self) -> Result<u64> {
        let byte_rate = self.byte_rate()?.max(1) as u64;
        Ok(self.data.len() as u64 * 1000 / byte_rate)
    }

    /// Append another stream. All segments must share the same fmt chunk.
    pub fn push(&mut self, other: &WavAudio) -> Result<()> {
        if other.fmt != self.fmt {
            return Err(anyhow!(
                "wav format mismatch: all segments must have the same sample rate and channels"
            ));
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }

    /// Append silence, rounded down to whole frames.
    pub fn push_silence(&mut self, ms: u64) -> Result<()> {
        let byte_rate = self.byte_rate()? as u64;
        let align = self.block_align()?.max(1) as u64;
        let mut len = byte_rate * ms / 1000;
        len -= len % align;
        self.data.resize(self.data.len() + len as usize, 0);
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.fmt.len() + self.data.len() + 44);
        out.extend_from_slice(b"RIFF");
        let chunk_size = 4 + 8 + self.fmt.len() as u32 + 8 + self.data.len() as u32;
        out.extend_from_slice(&chunk_size.to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&(self.fmt.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.fmt);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    fn fmt_u32(&self, offset: usize) -> Result<u32> {
        let end = offset + 4;
        if self.fmt.len() < end {
            return Err(anyhow!("fmt chunk too short"));
        }
        Ok(u32::from_le_bytes(self.fmt[offset..end].try_into()?))
    }

    fn fmt_u16(&self, offset: usize) -> Result<u16> {
        let end = offset + 2;
        if self.fmt.len() < end {
            return Err(anyhow!("fmt chunk too short"));
        }
        Ok(u16::from_le_bytes(self.fmt[offset..end].try_into()?))
    }
}

/// Make a string safe for use in filenames.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// 16-bit mono PCM test fixture.
#[cfg(test)]
pub(crate) fn dummy_wav(ms: u64, sample_rate: u32) -> Vec<u8> {
    let byte_rate = sample_rate * 2;
    let data_len = ((byte_rate as u64 * ms / 1000) & !1) as u32;

    let mut buf = Vec::new();
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.resize(buf.len() + data_len as usize, 0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let bytes = dummy_wav(500, 24000);
        let wav = WavAudio::parse(&bytes).unwrap();

        assert_eq!(wav.fmt.len(), 16);
        assert_eq!(wav.sample_rate().unwrap(), 24000);
        assert_eq!(wav.byte_rate().unwrap(), 48000);
        assert_eq!(wav.block_align().unwrap(), 2);
        assert_eq!(wav.duration_ms().unwrap(), 500);

        let rebuilt = WavAudio::parse(&wav.to_bytes()).unwrap();
        assert_eq!(rebuilt, wav);
    }

    #[test]
    fn test_push_concatenates_compatible_segments() {
        let a = WavAudio::parse(&dummy_wav(300, 24000)).unwrap();
        let b = WavAudio::parse(&dummy_wav(200, 24000)).unwrap();

        let mut combined = a.empty_like();
        combined.push(&a).unwrap();
        combined.push(&b).unwrap();
        assert_eq!(combined.duration_ms().unwrap(), 500);
    }

    #[test]
    fn test_push_rejects_format_mismatch() {
        let a = WavAudio::parse(&dummy_wav(300, 24000)).unwrap();
        let b = WavAudio::parse(&dummy_wav(200, 44100)).unwrap();

        let mut combined = a.empty_like();
        combined.push(&a).unwrap();
        assert!(combined.push(&b).is_err());
    }

    #[test]
    fn test_silence_is_frame_aligned() {
        let a = WavAudio::parse(&dummy_wav(100, 24000)).unwrap();
        let mut combined = a.empty_like();
        combined.push_silence(250).unwrap();

        assert_eq!(combined.data.len() % 2, 0);
        assert_eq!(combined.duration_ms().unwrap(), 250);
    }

    #[test]
    fn test_rejects_non_wav() {
        assert!(WavAudio::parse(b"ID3\x03whatever").is_err());
        assert!(WavAudio::parse(b"").is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Dr. Watson"), "dr__watson");
        assert_eq!(sanitize_filename("ALICE-2"), "alice-2");
    }
}
