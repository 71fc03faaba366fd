// Contextualization CD-ROM: a tiny ISO 9660 image carrying user-data for
// both amiconfig (ec2 layout) and cloud-init (openstack layout).

use chrono::Utc;

use crate::config::CONTEXT_IMAGE_SIZE;

const SECTOR: usize = 2048;

const PRIMARY_DESCRIPTOR_OFFSET: usize = 0x8000;
const TERMINATOR_OFFSET: usize = 0x8800;
const CONTENTS_OFFSET: usize = 0xC000;
const README_OFFSET: usize = 0xE000;
const EC2_META_OFFSET: usize = 0xE800;
const EC2_USER_OFFSET: usize = 0xF000;
const OS_META_OFFSET: usize = 0xF800;
const OS_USER_OFFSET: usize = 0x10000;

const VOLUME_ID: &str = "CONTEXT";
const APPLICATION_ID: &str = "CVM SESSION ENGINE CONTEXT IMAGE";

pub const README: &str = "\
We support two ways of contextualization: through amiconfig and cloud init.
Amiconfig and cloud-init pick up the (same) user-data from different paths.

Amiconfig:
Amiconfig data are put (in the plaintext format) to the \"/ec2/latest/user-data\" file.
\"ec2/latest/meta-data.json\" contains only an empty dictionary.

Cloud init:
Cloud init data are put (in the plaintext format) to the \"/openstack/latest/user_data\" file.
\"/openstack/latest/meta_data.json\" contains only an empty dictionary.
";

pub const META_DATA: &str = "{}\n";

#[derive(Debug, PartialEq)]
pub enum ImageFormat {
    Iso9660,
    Udf,
    Unknown,
}

/// Where each file lands inside the image for a given user-data length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLayout {
    pub readme: usize,
    pub ec2_meta: usize,
    pub ec2_user: usize,
    pub os_meta: usize,
    pub os_user: usize,
    /// User-data bytes actually stored (after truncation).
    pub content_len: usize,
}

fn align_after(offset: usize) -> usize {
    (offset + 1).div_ceil(SECTOR) * SECTOR
}

impl ContextLayout {
    fn for_length(len: usize) -> Self {
        let (os_meta, os_user) = if EC2_USER_OFFSET + len >= OS_META_OFFSET {
            let meta = align_after(EC2_USER_OFFSET + len);
            (meta, align_after(meta + META_DATA.len()))
        } else {
            (OS_META_OFFSET, OS_USER_OFFSET)
        };
        Self {
            readme: README_OFFSET,
            ec2_meta: EC2_META_OFFSET,
            ec2_user: EC2_USER_OFFSET,
            os_meta,
            os_user,
            content_len: len,
        }
    }

    /// Layout for `len` bytes of user-data, shrinking it until the second
    /// copy fits inside the image.
    pub fn fit(len: usize) -> Self {
        let mut len = len.min(CONTEXT_IMAGE_SIZE - EC2_USER_OFFSET);
        loop {
            let layout = Self::for_length(len);
            let end = layout.os_user + len;
            if end <= CONTEXT_IMAGE_SIZE {
                return layout;
            }
            // Every byte dropped shrinks both copies.
            len -= (end - CONTEXT_IMAGE_SIZE).div_ceil(2).min(len);
        }
    }
}

/// Both-endian 32-bit field as used throughout ISO 9660.
fn put_both_endian(buf: &mut [u8], value: u32) {
    buf[..4].copy_from_slice(&value.to_le_bytes());
    buf[4..8].copy_from_slice(&value.to_be_bytes());
}

fn put_padded(buf: &mut [u8], text: &str) {
    buf.fill(b' ');
    let n = text.len().min(buf.len());
    buf[..n].copy_from_slice(&text.as_bytes()[..n]);
}

fn primary_descriptor(data_size: usize) -> [u8; SECTOR] {
    let mut d = [0u8; SECTOR];
    d[0] = 1;
    d[1..6].copy_from_slice(b"CD001");
    d[6] = 1;
    put_padded(&mut d[8..40], "");
    put_padded(&mut d[40..72], VOLUME_ID);

    let blocks = (CONTENTS_OFFSET + data_size).div_ceil(SECTOR) as u32;
    put_both_endian(&mut d[80..88], blocks);
    // volume set size, sequence number, logical block size (both-endian 16-bit)
    d[120..124].copy_from_slice(&[1, 0, 0, 1]);
    d[124..128].copy_from_slice(&[1, 0, 0, 1]);
    let block = (SECTOR as u16).to_le_bytes();
    let block_be = (SECTOR as u16).to_be_bytes();
    d[128..132].copy_from_slice(&[block[0], block[1], block_be[0], block_be[1]]);

    put_padded(&mut d[190..318], "");
    put_padded(&mut d[318..446], "");
    put_padded(&mut d[446..574], "");
    put_padded(&mut d[574..702], APPLICATION_ID);
    put_padded(&mut d[702..813], "");

    let now = Utc::now().format("%Y%m%d%H%M%S00").to_string();
    for field in [813, 830, 864] {
        d[field..field + 16].copy_from_slice(now.as_bytes());
        d[field + 16] = 0;
    }
    d[847..863].fill(b'0');
    d[863] = 0;
    d[881] = 1;
    d
}

fn terminator() -> [u8; 7] {
    let mut t = [0u8; 7];
    t[0] = 255;
    t[1..6].copy_from_slice(b"CD001");
    t[6] = 1;
    t
}

/// Build the contextualization image for `content`. The result is always
/// exactly `CONTEXT_IMAGE_SIZE` bytes, zero padded; oversized content is
/// truncated.
pub fn build_context_image(content: &[u8]) -> Vec<u8> {
    let layout = ContextLayout::fit(content.len());
    let content = &content[..layout.content_len];
    let data_size = 2 * content.len() + 2 * META_DATA.len() + README.len();

    let mut bytes = vec![0u8; CONTEXT_IMAGE_SIZE];
    bytes[PRIMARY_DESCRIPTOR_OFFSET..PRIMARY_DESCRIPTOR_OFFSET + SECTOR]
        .copy_from_slice(&primary_descriptor(data_size.min(CONTEXT_IMAGE_SIZE - CONTENTS_OFFSET)));
    let term = terminator();
    bytes[TERMINATOR_OFFSET..TERMINATOR_OFFSET + term.len()].copy_from_slice(&term);

    let mut place = |offset: usize, data: &[u8]| {
        bytes[offset..offset + data.len()].copy_from_slice(data);
    };
    place(layout.readme, README.as_bytes());
    place(layout.ec2_meta, META_DATA.as_bytes());
    place(layout.ec2_user, content);
    place(layout.os_meta, META_DATA.as_bytes());
    place(layout.os_user, content);
    bytes
}

/// Identify an optical image from its first sectors. The volume descriptor
/// area starts at sector 16 (offset 32768).
pub fn detect_iso(data: &[u8]) -> ImageFormat {
    let start = PRIMARY_DESCRIPTOR_OFFSET;
    let Some(id) = data.get(start + 1..start + 6) else {
        return ImageFormat::Unknown;
    };
    if id == b"CD001" {
        ImageFormat::Iso9660
    } else if id == b"BEA01" || id == b"NSR02" || id == b"NSR03" {
        ImageFormat::Udf
    } else {
        ImageFormat::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_content_uses_fixed_offsets() {
        let img = build_context_image(b"#!/bin/sh\necho hi\n");
        assert_eq!(img.len(), CONTEXT_IMAGE_SIZE);
        assert_eq!(detect_iso(&img), ImageFormat::Iso9660);
        assert_eq!(&img[EC2_USER_OFFSET..EC2_USER_OFFSET + 9], b"#!/bin/sh");
        assert_eq!(&img[OS_USER_OFFSET..OS_USER_OFFSET + 9], b"#!/bin/sh");
        assert_eq!(&img[EC2_META_OFFSET..EC2_META_OFFSET + 2], b"{}");
        assert_eq!(&img[OS_META_OFFSET..OS_META_OFFSET + 2], b"{}");
        assert!(img[README_OFFSET..].starts_with(b"We support two ways"));
        assert_eq!(img[TERMINATOR_OFFSET], 255);
    }

    #[test]
    fn test_large_content_relocates_openstack_copy() {
        let content = vec![b'x'; 5000];
        let layout = ContextLayout::fit(content.len());
        assert_eq!(layout.os_meta % SECTOR, 0);
        assert_eq!(layout.os_user % SECTOR, 0);
        assert!(layout.os_meta > EC2_USER_OFFSET + 5000);
        assert!(layout.os_user > layout.os_meta);

        let img = build_context_image(&content);
        assert_eq!(img[layout.os_user + 4999], b'x');
        assert_eq!(img[layout.ec2_user + 4999], b'x');
    }

    #[test]
    fn test_oversized_content_is_truncated() {
        let content = vec![b'y'; CONTEXT_IMAGE_SIZE];
        let layout = ContextLayout::fit(content.len());
        assert!(layout.content_len < content.len());
        assert!(layout.content_len > 100_000);
        assert!(layout.os_user + layout.content_len <= CONTEXT_IMAGE_SIZE);
        assert_eq!(build_context_image(&content).len(), CONTEXT_IMAGE_SIZE);
    }

    #[test]
    fn test_detect_udf_and_unknown() {
        let mut data = vec![0u8; 0x8800];
        data[0x8001..0x8006].copy_from_slice(b"NSR02");
        assert_eq!(detect_iso(&data), ImageFormat::Udf);
        assert_eq!(detect_iso(&[0u8; 16]), ImageFormat::Unknown);
    }
}
