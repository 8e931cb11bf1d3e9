//! Raw firmware images.
//!
//! A [`FlashImage`] is a flat binary written from the start of code flash.
//! Padding always works on a copy; the loaded bytes never change.

use {
    crate::error::{Error, Result},
    log::debug,
    std::{fs::File, io::Read, path::Path},
};

/// Filler used to round images up to a transfer boundary.
pub const PAD_BYTE: u8 = 0xFF;

/// Immutable firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    data: Vec<u8>,
}

/// One transfer unit of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Offset from the start of the image.
    pub offset: usize,
    /// Chunk bytes.
    pub data: &'a [u8],
    /// Bytes left to transfer, including this chunk.
    pub remaining: usize,
}

impl FlashImage {
    /// Wrap raw bytes.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Load a binary file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading image from: {}", path.display());

        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Err(Error::Config(format!("{} is empty", path.display())));
        }
        Ok(Self { data })
    }

    /// Image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Whether the image has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }

    /// Copy of the image rounded up to a multiple of `align` with 0xFF.
    pub fn padded(&self, align: usize) -> Vec<u8> {
        pad_to(&self.data, align)
    }
}

/// Round `data` up to a multiple of `align` with [`PAD_BYTE`].
///
/// Already aligned input is returned unchanged; nothing is ever truncated.
pub fn pad_to(data: &[u8], align: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    if align > 1 {
        out.resize(data.len().next_multiple_of(align), PAD_BYTE);
    }
    out
}

/// Split `data` into chunks of at most `size` bytes.
pub fn chunks(data: &[u8], size: usize) -> impl Iterator<Item = Chunk<'_>> {
    let total = data.len();
    data.chunks(size.max(1))
        .enumerate()
        .map(move |(i, chunk)| {
            let offset = i * size.max(1);
            Chunk {
                offset,
                data: chunk,
                remaining: total - offset,
            }
        })
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    #[test]
    fn test_pad_rounds_up_with_ff() {
        let padded = pad_to(&[1, 2, 3], 8);
        assert_eq!(padded, vec![1, 2, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_pad_is_idempotent() {
        let once = pad_to(&[0u8; 13], 8);
        let twice = pad_to(&once, 8);
        assert_eq!(once.len(), 16);
        assert_eq!(once, twice);
        assert_eq!(pad_to(&[7u8; 5], 1), vec![7u8; 5]);
    }

    #[test]
    fn test_padded_leaves_image_untouched() {
        let image = FlashImage::from_bytes(vec![0xAA; 10]);
        let padded = image.padded(128);
        assert_eq!(padded.len(), 128);
        assert_eq!(image.len(), 10);
        assert_eq!(&padded[..10], image.as_bytes());
    }

    #[test]
    fn test_chunks_reconstruct_image() {
        let data: Vec<u8> = (0..200u8).collect();
        let parts: Vec<_> = chunks(&data, 56).collect();
        assert_eq!(parts.len(), 4);
        assert!(
            parts
                .iter()
                .all(|c| c.data.len() <= 56)
        );
        assert_eq!(parts[1].offset, 56);
        assert_eq!(parts[1].remaining, 144);
        assert_eq!(parts[3].data.len(), 32);
        let joined: Vec<u8> = parts
            .iter()
            .flat_map(|c| c.data.iter().copied())
            .collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x01, 0x02])
            .unwrap();
        let image = FlashImage::from_file(file.path()).unwrap();
        assert_eq!(image.as_bytes(), &[0x01, 0x02]);
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            FlashImage::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }
}
