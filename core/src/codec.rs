//! Streaming LZ4 compression over a file-to-file interface.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Extension marking an object as LZ4-compressed.
pub const LZ4_EXTENSION: &str = ".lz4";

const CHUNK_SIZE: usize = 4096;

/// True iff the key refers to a compressed object. Decompressing anything
/// this returns false for is undefined; callers gate on it.
pub fn is_compressed(key: &str) -> bool {
    key.ends_with(LZ4_EXTENSION)
}

/// Compress `in_path` into a uniquely-named file under `tmp_dir` and return
/// its path. The caller takes ownership of the output file and must remove
/// it. Unique names matter here: several source files share a basename
/// (pg_notify/0000, pg_subtrans/0000).
pub fn compress(in_path: &Path, tmp_dir: &Path) -> Result<PathBuf> {
    let (out_file, out_path) = tempfile::Builder::new()
        .prefix("pgferry.")
        .tempfile_in(tmp_dir)?
        .keep()
        .map_err(|e| Error::Io(e.error))?;

    match compress_into(in_path, out_file) {
        Ok(()) => Ok(out_path),
        Err(err) => {
            // nothing useful can be done with a partial scratch file
            let _ = std::fs::remove_file(&out_path);
            Err(err)
        }
    }
}

fn compress_into(in_path: &Path, out_file: File) -> Result<()> {
    let mut reader = BufReader::new(File::open(in_path)?);
    let mut writer = lz4::EncoderBuilder::new().build(out_file)?;

    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }

    let (_, result) = writer.finish();
    result?;

    Ok(())
}

/// Decompress `in_path` to `out_path`.
pub fn decompress(in_path: &Path, out_path: &Path) -> Result<()> {
    let mut reader = lz4::Decoder::new(File::open(in_path)?)?;
    let mut writer = BufWriter::new(File::create(out_path)?);

    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;

    Ok(())
}
