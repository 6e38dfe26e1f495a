use anyhow::{anyhow, Context, Result};
use log::warn;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Encoded files smaller than this are treated as a silently failed
/// conversion: encoders missing their codec can emit a header-only file
/// without reporting an error.
pub const MIN_ENCODED_BYTES: u64 = 1024;

async fn run_ffmpeg(args: &[&str]) -> Result<()> {
    let status = Command::new("ffmpeg")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("failed to spawn ffmpeg")?;

    if !status.success() {
        return Err(anyhow!("ffmpeg exited with {}", status));
    }
    Ok(())
}

/// Encode a WAV file into the target container under `out_dir`, falling back
/// to a lossless copy when the encoder fails or silently produces an
/// implausibly small file. Returns the path of whichever artifact survived.
pub async fn encode_with_fallback(wav_path: &Path, out_dir: &Path, base_name: &str) -> Result<PathBuf> {
    let mp3_path = out_dir.join(format!("{}.mp3", base_name));
    match encode_mp3(wav_path, &mp3_path).await {
        Ok(()) => return Ok(mp3_path),
        Err(e) => warn!("mp3 encode failed for {} ({}), keeping lossless wav", base_name, e),
    }

    let wav_out = out_dir.join(format!("{}.wav", base_name));
    tokio::fs::copy(wav_path, &wav_out)
        .await
        .with_context(|| format!("failed to copy wav fallback to {}", wav_out.display()))?;
    Ok(wav_out)
}

async fn encode_mp3(wav_path: &Path, mp3_path: &Path) -> Result<()> {
    let input = wav_path.to_string_lossy().into_owned();
    let output = mp3_path.to_string_lossy().into_owned();
    run_ffmpeg(&["-y", "-i", &input, "-b:a", "192k", &output]).await?;

    let size = tokio::fs::metadata(mp3_path).await.map(|m| m.len()).unwrap_or(0);
    if size < MIN_ENCODED_BYTES {
        let _ = tokio::fs::remove_file(mp3_path).await;
        return Err(anyhow!("encoder produced an invalid {}-byte file", size));
    }
    Ok(())
}

/// Load any supported container as WAV bytes, decoding through the external
/// utility when the file is not already WAV.
pub async fn decode_to_wav(path: &Path) -> Result<Vec<u8>> {
    let is_wav = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if is_wav {
        return Ok(tokio::fs::read(path).await?);
    }

    let tmp = path.with_extension("decode.tmp.wav");
    let input = path.to_string_lossy().into_owned();
    let output = tmp.to_string_lossy().into_owned();
    let result = run_ffmpeg(&["-y", "-i", &input, &output])
        .await
        .with_context(|| format!("failed to decode {}", path.display()));

    match result {
        Ok(()) => {
            let bytes = tokio::fs::read(&tmp).await?;
            let _ = tokio::fs::remove_file(&tmp).await;
            Ok(bytes)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}
