// IDX dataset files (all header integers big-endian on disk):
//   images: magic | count(u32) | rows(u32) | cols(u32) | pixels(u8 ...)
//   labels: magic | count(u32) | labels(u8 ...)
//
// Magic values are compared as read on a little-endian host, before any
// byte swap. Count, rows and cols are swapped before use.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use inferport_core::{Error, Result};
use serde::Deserialize;
use tracing::debug;

pub const IMAGE_MAGIC: u32 = 0x0308_0000;
pub const LABEL_MAGIC: u32 = 0x0108_0000;

const IMAGE_HEADER_LEN: u64 = 16;
const LABEL_HEADER_LEN: u64 = 8;

/// Reverses the byte order of a 4-byte word. Applying it twice is a no-op.
pub fn swap_endian(word: u32) -> u32 {
    word.swap_bytes()
}

/// One dataset record.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// `rows * cols` pixel values, in `[0, 1]` when scaling is enabled.
    pub features: Vec<f32>,
    pub label: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdxHeader {
    pub count: usize,
    pub rows: usize,
    pub cols: usize,
}

impl IdxHeader {
    /// Bytes per image, or `None` when `rows * cols` overflows.
    pub fn record_len(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }
}

/// A pair of companion image and label files.
///
/// Holds paths only: every read opens, seeks and closes both files.
#[derive(Clone, Debug, Deserialize)]
pub struct IdxDataset {
    pub images: PathBuf,
    pub labels: PathBuf,
    #[serde(default = "default_scale")]
    pub scale: bool,
}

fn default_scale() -> bool {
    true
}

impl IdxDataset {
    pub fn new(images: impl Into<PathBuf>, labels: impl Into<PathBuf>, scale: bool) -> Self {
        Self {
            images: images.into(),
            labels: labels.into(),
            scale,
        }
    }

    /// Reads the image header.
    pub fn header(&self) -> Result<IdxHeader> {
        let mut file = open(&self.images)?;
        read_image_header(&mut file, &self.images)
    }

    pub fn read_sample(&self, index: usize) -> Result<Sample> {
        read_sample(&self.images, &self.labels, index, self.scale)
    }
}

/// Reads record `index` from an image file and its label file.
///
/// Fails with [`Error::Io`] when a file cannot be opened or read and with
/// [`Error::Format`] on a bad magic value, an index past the recorded count
/// or a file too short to hold the record.
pub fn read_sample(
    images: impl AsRef<Path>,
    labels: impl AsRef<Path>,
    index: usize,
    scale: bool,
) -> Result<Sample> {
    let (images, labels) = (images.as_ref(), labels.as_ref());
    let mut image_file = open(images)?;
    let mut label_file = open(labels)?;

    let header = read_image_header(&mut image_file, images)?;
    let label_count = read_label_header(&mut label_file, labels)?;
    if index >= header.count || index >= label_count {
        return Err(Error::format(format!(
            "record {index} out of range ({} images, {label_count} labels)",
            header.count
        )));
    }

    let (offset, record_len) = record_span(&header, index).ok_or_else(|| {
        Error::format(format!("{}: record {index} overflows", images.display()))
    })?;
    let file_len = image_file
        .metadata()
        .map_err(|e| Error::io(images, e))?
        .len();
    if offset.saturating_add(record_len as u64) > file_len {
        return Err(Error::format(format!(
            "{}: truncated, wanted {record_len} bytes at offset {offset}, file is {file_len} bytes",
            images.display()
        )));
    }
    let mut pixels = vec![0u8; record_len];
    read_at(&mut image_file, images, offset, &mut pixels)?;

    let mut label = [0u8; 1];
    read_at(&mut label_file, labels, LABEL_HEADER_LEN + index as u64, &mut label)?;

    let features = pixels
        .iter()
        .map(|&p| {
            let v = f32::from(p);
            if scale {
                v / 255.0
            } else {
                v
            }
        })
        .collect();
    debug!(index, label = label[0], len = record_len, "sample read");
    Ok(Sample {
        features,
        label: label[0],
    })
}

/// Byte offset and length of image `index`.
fn record_span(header: &IdxHeader, index: usize) -> Option<(u64, usize)> {
    let len = header.record_len()?;
    let skip = u64::try_from(index.checked_mul(len)?).ok()?;
    Some((IMAGE_HEADER_LEN.checked_add(skip)?, len))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::io(path, e))
}

fn read_image_header(file: &mut File, path: &Path) -> Result<IdxHeader> {
    let mut raw = [0u8; IMAGE_HEADER_LEN as usize];
    read_at(file, path, 0, &mut raw)?;
    let words = le_words(&raw);
    check_magic(path, words[0], IMAGE_MAGIC)?;
    let header = IdxHeader {
        count: swap_endian(words[1]) as usize,
        rows: swap_endian(words[2]) as usize,
        cols: swap_endian(words[3]) as usize,
    };
    if header.rows == 0 || header.cols == 0 {
        return Err(Error::format(format!(
            "{}: empty image dimensions {}x{}",
            path.display(),
            header.rows,
            header.cols
        )));
    }
    debug!(
        path = %path.display(),
        count = header.count,
        rows = header.rows,
        cols = header.cols,
        "image header"
    );
    Ok(header)
}

fn read_label_header(file: &mut File, path: &Path) -> Result<usize> {
    let mut raw = [0u8; LABEL_HEADER_LEN as usize];
    read_at(file, path, 0, &mut raw)?;
    let words = le_words(&raw);
    check_magic(path, words[0], LABEL_MAGIC)?;
    Ok(swap_endian(words[1]) as usize)
}

fn le_words(raw: &[u8]) -> Vec<u32> {
    raw.chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

fn check_magic(path: &Path, got: u32, expected: u32) -> Result<()> {
    if got != expected {
        return Err(Error::format(format!(
            "{}: bad magic {got:#010x}, expected {expected:#010x}",
            path.display()
        )));
    }
    Ok(())
}

/// Seeks to `offset` and fills `buf`, then checks the byte count.
fn read_at(file: &mut File, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, e))?;
    let got = fill(file, buf).map_err(|e| Error::io(path, e))?;
    if got != buf.len() {
        return Err(Error::format(format!(
            "{}: truncated, wanted {} bytes at offset {offset}, found {got}",
            path.display(),
            buf.len()
        )));
    }
    Ok(())
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes an IDX image file holding `images`, each `rows * cols` bytes.
pub fn write_idx_images(
    path: impl AsRef<Path>,
    rows: u32,
    cols: u32,
    images: &[&[u8]],
) -> Result<()> {
    let path = path.as_ref();
    let mut buf = Vec::with_capacity(16 + images.len() * (rows * cols) as usize);
    buf.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
    for word in [images.len() as u32, rows, cols] {
        buf.extend_from_slice(&word.to_be_bytes());
    }
    for image in images {
        buf.extend_from_slice(image);
    }
    std::fs::write(path, buf).map_err(|e| Error::io(path, e))
}

/// Writes an IDX label file.
pub fn write_idx_labels(path: impl AsRef<Path>, labels: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let mut buf = Vec::with_capacity(8 + labels.len());
    buf.extend_from_slice(&LABEL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(labels.len() as u32).to_be_bytes());
    buf.extend_from_slice(labels);
    std::fs::write(path, buf).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0)]
    #[case(0x0000_0803)]
    #[case(0xdead_beef)]
    #[case(u32::MAX)]
    fn swap_is_self_inverse(#[case] word: u32) {
        assert_eq!(swap_endian(swap_endian(word)), word);
    }

    #[test]
    fn swap_maps_between_magic_representations() {
        assert_eq!(swap_endian(0x0000_0803), IMAGE_MAGIC);
        assert_eq!(swap_endian(IMAGE_MAGIC), 0x0000_0803);
        assert_eq!(swap_endian(0x0000_0801), LABEL_MAGIC);
    }

    #[test]
    fn magic_matches_big_endian_file_bytes() {
        let on_disk = [0x00, 0x00, 0x08, 0x03];
        assert_eq!(u32::from_le_bytes(on_disk), IMAGE_MAGIC);
        assert_eq!(u32::from_be_bytes(on_disk), 2051);
    }

    #[test]
    fn record_span_rejects_overflow() {
        let header = IdxHeader {
            count: usize::MAX,
            rows: usize::MAX,
            cols: 2,
        };
        assert_eq!(record_span(&header, 0), None);
        let header = IdxHeader {
            count: usize::MAX,
            rows: 28,
            cols: 28,
        };
        assert_eq!(record_span(&header, 2), Some((16 + 2 * 784, 784)));
        assert_eq!(record_span(&header, usize::MAX), None);
    }

    #[test]
    fn fill_reports_short_reads() {
        let mut src: &[u8] = &[1, 2, 3];
        let mut buf = [0u8; 5];
        assert_eq!(fill(&mut src, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }
}
