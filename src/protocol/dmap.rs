//! DMAP tagged-stream decoding
//!
//! iTunes sends track metadata as a DMAP stream: tuples of a 4-byte tag, a
//! 4-byte big-endian length and that many value bytes, concatenated. The
//! first eight bytes of a `SET_PARAMETER` metadata body are the enclosing
//! container header and are skipped.

/// Size of the container header preceding the tag tuples.
pub const CONTAINER_HEADER_LEN: usize = 8;

/// One decoded DMAP tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmapEntry<'a> {
    /// Four-character tag, e.g. `minm` for the track title
    pub tag: [u8; 4],
    /// Raw value bytes
    pub value: &'a [u8],
}

/// Iterate over the tag tuples of a DMAP body, skipping the container
/// header. Truncated trailing tuples are clipped to the available bytes.
#[must_use]
pub fn entries(body: &[u8]) -> DmapEntries<'_> {
    DmapEntries {
        body,
        offset: CONTAINER_HEADER_LEN,
    }
}

/// Iterator over DMAP tuples
#[derive(Debug)]
pub struct DmapEntries<'a> {
    body: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for DmapEntries<'a> {
    type Item = DmapEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 8 > self.body.len() {
            return None;
        }

        let mut tag = [0u8; 4];
        tag.copy_from_slice(&self.body[self.offset..self.offset + 4]);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.body[self.offset + 4..self.offset + 8]);
        let declared = u32::from_be_bytes(len_bytes) as usize;

        let start = self.offset + 8;
        let end = start.saturating_add(declared).min(self.body.len());
        self.offset = end;

        Some(DmapEntry {
            tag,
            value: &self.body[start..end],
        })
    }
}
