use std::fs;
use std::io::Read;
use std::path::Path;

use image::RgbaImage;
use thiserror::Error;

/// Total header length including the 4-byte magic.
pub const HEADER_LEN: usize = 128;

const MAGIC: &[u8; 4] = b"DDS ";
const HEADER_SIZE: u32 = 124;
// CAPS | HEIGHT | WIDTH | PIXELFORMAT | LINEARSIZE
const FLAGS: u32 = 0x1 | 0x2 | 0x4 | 0x1000 | 0x80000;
const PF_SIZE: u32 = 32;
const PF_FLAG_FOURCC: u32 = 0x4;
const FOURCC_DXT1: &[u8; 4] = b"DXT1";
const CAPS_TEXTURE: u32 = 0x1000;

#[derive(Debug, Error)]
pub enum DdsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a DDS file: {0}")]
    Format(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

fn blocks_across(dim: u32) -> u32 {
    dim.div_ceil(4)
}

/// Compressed payload length for a `w x h` DXT1 image.
pub fn data_len(w: u32, h: u32) -> usize {
    blocks_across(w) as usize * blocks_across(h) as usize * 8
}

fn to_565(r: u8, g: u8, b: u8) -> u16 {
    let r = (r as u16 * 31 + 127) / 255;
    let g = (g as u16 * 63 + 127) / 255;
    let b = (b as u16 * 31 + 127) / 255;
    (r << 11) | (g << 5) | b
}

fn from_565(c: u16) -> [u8; 3] {
    let r = ((c >> 11) & 0x1F) as u8;
    let g = ((c >> 5) & 0x3F) as u8;
    let b = (c & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

fn dist2(a: [u8; 3], b: [u8; 3]) -> u32 {
    let dr = a[0] as i32 - b[0] as i32;
    let dg = a[1] as i32 - b[1] as i32;
    let db = a[2] as i32 - b[2] as i32;
    (dr * dr + dg * dg + db * db) as u32
}

fn write_header(out: &mut Vec<u8>, width: u32, height: u32) {
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&HEADER_SIZE.to_le_bytes());
    out.extend_from_slice(&FLAGS.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&(data_len(width, height) as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // depth
    out.extend_from_slice(&0u32.to_le_bytes()); // mipmap count
    out.extend_from_slice(&[0u8; 44]); // reserved1
    out.extend_from_slice(&PF_SIZE.to_le_bytes());
    out.extend_from_slice(&PF_FLAG_FOURCC.to_le_bytes());
    out.extend_from_slice(FOURCC_DXT1);
    out.extend_from_slice(&[0u8; 20]); // rgb bit count + masks
    out.extend_from_slice(&CAPS_TEXTURE.to_le_bytes());
    out.extend_from_slice(&[0u8; 16]); // caps2..4 + reserved2
    debug_assert_eq!(out.len(), HEADER_LEN);
}

/// Encode one 4x4 block. Pixels are row-major RGB, 16 entries.
fn encode_block(pixels: &[[u8; 3]; 16], out: &mut Vec<u8>) {
    let mut min = [255u8; 3];
    let mut max = [0u8; 3];
    for p in pixels {
        for c in 0..3 {
            min[c] = min[c].min(p[c]);
            max[c] = max[c].max(p[c]);
        }
    }
    let mut c0 = to_565(max[0], max[1], max[2]);
    let mut c1 = to_565(min[0], min[1], min[2]);
    if c0 < c1 {
        std::mem::swap(&mut c0, &mut c1);
    }

    out.extend_from_slice(&c0.to_le_bytes());
    out.extend_from_slice(&c1.to_le_bytes());

    if c0 == c1 {
        out.extend_from_slice(&0u32.to_le_bytes());
        return;
    }

    let p0 = from_565(c0);
    let p1 = from_565(c1);
    let palette = [
        p0,
        p1,
        [
            ((2 * p0[0] as u16 + p1[0] as u16) / 3) as u8,
            ((2 * p0[1] as u16 + p1[1] as u16) / 3) as u8,
            ((2 * p0[2] as u16 + p1[2] as u16) / 3) as u8,
        ],
        [
            ((p0[0] as u16 + 2 * p1[0] as u16) / 3) as u8,
            ((p0[1] as u16 + 2 * p1[1] as u16) / 3) as u8,
            ((p0[2] as u16 + 2 * p1[2] as u16) / 3) as u8,
        ],
    ];

    // 16 two-bit selectors, row-major within the block, LSB first.
    let mut word = 0u32;
    for (i, p) in pixels.iter().enumerate() {
        let mut best = 0u32;
        let mut best_d = u32::MAX;
        for (idx, pal) in palette.iter().enumerate() {
            let d = dist2(*p, *pal);
            if d < best_d {
                best_d = d;
                best = idx as u32;
            }
        }
        word |= best << (2 * i);
    }
    out.extend_from_slice(&word.to_le_bytes());
}

/// Encode an RGBA image into a complete DXT1 DDS byte stream. Edge blocks of
/// images whose dimensions are not multiples of 4 replicate the border pixel.
pub fn encode(img: &RgbaImage) -> Vec<u8> {
    let (w, h) = img.dimensions();
    let mut out = Vec::with_capacity(HEADER_LEN + data_len(w, h));
    write_header(&mut out, w, h);

    for by in 0..blocks_across(h) {
        for bx in 0..blocks_across(w) {
            let mut pixels = [[0u8; 3]; 16];
            for py in 0..4u32 {
                for px in 0..4u32 {
                    let x = (bx * 4 + px).min(w.saturating_sub(1));
                    let y = (by * 4 + py).min(h.saturating_sub(1));
                    let p = img.get_pixel(x, y).0;
                    pixels[(py * 4 + px) as usize] = [p[0], p[1], p[2]];
                }
            }
            encode_block(&pixels, &mut out);
        }
    }
    out
}

/// Parse the header of a DDS byte stream; returns (width, height).
pub fn parse_header(bytes: &[u8]) -> Result<(u32, u32), DdsError> {
    if bytes.len() < HEADER_LEN {
        return Err(DdsError::Format("file shorter than header".into()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(DdsError::Format("bad magic".into()));
    }
    let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if size != HEADER_SIZE {
        return Err(DdsError::Format(format!("unexpected header size {size}")));
    }
    if &bytes[84..88] != FOURCC_DXT1 {
        return Err(DdsError::Format("pixel format is not DXT1".into()));
    }
    let height = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let width = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    Ok((width, height))
}

/// Width/height of a DDS file, reading only the header.
pub fn read_dimensions(path: &Path) -> Result<(u32, u32), DdsError> {
    let mut head = [0u8; HEADER_LEN];
    let mut f = fs::File::open(path)?;
    f.read_exact(&mut head)?;
    parse_header(&head)
}

/// Structural validation: magic, DXT1 pixel format, and exact payload length
/// for the header's dimensions.
pub fn validate(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok((w, h)) = read_dimensions(path) else {
        return false;
    };
    w > 0 && h > 0 && meta.len() == (HEADER_LEN + data_len(w, h)) as u64
}

/// Decode a DXT1 DDS byte stream into an RGBA image.
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbaImage, DdsError> {
    let (w, h) = parse_header(bytes)?;
    let expected = HEADER_LEN + data_len(w, h);
    if bytes.len() != expected {
        return Err(DdsError::Format(format!(
            "payload length {} != expected {expected}",
            bytes.len()
        )));
    }

    let mut img = RgbaImage::new(w, h);
    let mut off = HEADER_LEN;
    for by in 0..blocks_across(h) {
        for bx in 0..blocks_across(w) {
            let c0 = u16::from_le_bytes([bytes[off], bytes[off + 1]]);
            let c1 = u16::from_le_bytes([bytes[off + 2], bytes[off + 3]]);
            let word = u32::from_le_bytes(bytes[off + 4..off + 8].try_into().unwrap());
            off += 8;

            let p0 = from_565(c0);
            let p1 = from_565(c1);
            // Four-color opaque palette when c0 > c1, else three colors plus
            // 1-bit transparency.
            let palette: [[u8; 4]; 4] = if c0 > c1 {
                [
                    [p0[0], p0[1], p0[2], 255],
                    [p1[0], p1[1], p1[2], 255],
                    [
                        ((2 * p0[0] as u16 + p1[0] as u16) / 3) as u8,
                        ((2 * p0[1] as u16 + p1[1] as u16) / 3) as u8,
                        ((2 * p0[2] as u16 + p1[2] as u16) / 3) as u8,
                        255,
                    ],
                    [
                        ((p0[0] as u16 + 2 * p1[0] as u16) / 3) as u8,
                        ((p0[1] as u16 + 2 * p1[1] as u16) / 3) as u8,
                        ((p0[2] as u16 + 2 * p1[2] as u16) / 3) as u8,
                        255,
                    ],
                ]
            } else {
                [
                    [p0[0], p0[1], p0[2], 255],
                    [p1[0], p1[1], p1[2], 255],
                    [
                        ((p0[0] as u16 + p1[0] as u16) / 2) as u8,
                        ((p0[1] as u16 + p1[1] as u16) / 2) as u8,
                        ((p0[2] as u16 + p1[2] as u16) / 2) as u8,
                        255,
                    ],
                    [0, 0, 0, 0],
                ]
            };

            for py in 0..4u32 {
                for px in 0..4u32 {
                    let x = bx * 4 + px;
                    let y = by * 4 + py;
                    if x >= w || y >= h {
                        continue;
                    }
                    let idx = ((word >> (2 * (py * 4 + px))) & 0x3) as usize;
                    img.put_pixel(x, y, image::Rgba(palette[idx]));
                }
            }
        }
    }
    Ok(img)
}

/// Decode a DDS file into an RGBA image.
pub fn decode(path: &Path) -> Result<RgbaImage, DdsError> {
    let bytes = fs::read(path)?;
    decode_bytes(&bytes)
}

/// Encode an in-memory image straight to a DDS file.
pub fn convert_image(img: &RgbaImage, dds_path: &Path) -> Result<(), DdsError> {
    fs::write(dds_path, encode(img))?;
    Ok(())
}

/// Transcode a PNG file to a DDS file.
pub fn convert(png_path: &Path, dds_path: &Path) -> Result<(), DdsError> {
    let img = image::open(png_path)?.to_rgba8();
    convert_image(&img, dds_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn header_and_length() {
        let img = RgbaImage::from_pixel(512, 512, Rgba([80, 120, 200, 255]));
        let bytes = encode(&img);
        assert_eq!(bytes.len(), 128 + (512 / 4) * (512 / 4) * 8);
        assert_eq!(bytes.len(), 131_200);
        let (w, h) = parse_header(&bytes).unwrap();
        assert_eq!((w, h), (512, 512));
        // Height at offset 12, width at 16, both little-endian.
        assert_eq!(&bytes[12..16], &512u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &512u32.to_le_bytes());
        assert_eq!(&bytes[84..88], b"DXT1");
    }

    #[test]
    fn flat_color_round_trip_exact() {
        // Pure red survives the 565 round trip exactly.
        let img = RgbaImage::from_pixel(16, 8, Rgba([255, 0, 0, 255]));
        let back = decode_bytes(&encode(&img)).unwrap();
        assert_eq!(back.dimensions(), (16, 8));
        for p in back.pixels() {
            assert_eq!(p.0, [255, 0, 0, 255]);
        }
    }

    #[test]
    fn selector_packing_layout() {
        // Block: pixel (1,0) black, all others white. White becomes c0
        // (0xFFFF), black c1 (0x0000); selectors row-major LSB-first give
        // the index word 0b01 << 2.
        let mut img = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        img.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        let bytes = encode(&img);
        assert_eq!(&bytes[128..130], &0xFFFFu16.to_le_bytes());
        assert_eq!(&bytes[130..132], &0x0000u16.to_le_bytes());
        assert_eq!(&bytes[132..136], &4u32.to_le_bytes());
    }

    #[test]
    fn quantization_error_bounded() {
        // A two-color block decodes to within the palette quantization
        // error of the originals.
        let mut img = RgbaImage::from_pixel(4, 4, Rgba([200, 180, 90, 255]));
        for x in 0..4 {
            img.put_pixel(x, 3, Rgba([30, 60, 40, 255]));
        }
        let back = decode_bytes(&encode(&img)).unwrap();
        for (x, y, p) in back.enumerate_pixels() {
            let want = if y == 3 { [30u8, 60, 40] } else { [200, 180, 90] };
            for c in 0..3 {
                let d = (p.0[c] as i32 - want[c] as i32).abs();
                assert!(d <= 8, "pixel ({x},{y}) channel {c} off by {d}");
            }
        }
    }

    #[test]
    fn validate_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.dds");
        let img = RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 255]));
        convert_image(&img, &path).unwrap();
        assert!(validate(&path));

        // Truncated file fails.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(!validate(&path));

        // Wrong magic fails.
        let mut bytes2 = bytes.clone();
        bytes2[0] = b'X';
        fs::write(&path, &bytes2).unwrap();
        assert!(!validate(&path));
    }

    #[test]
    fn three_color_mode_decodes_transparent() {
        // Hand-build a single block with c0 <= c1 and index 3 everywhere.
        let mut bytes = Vec::new();
        write_header(&mut bytes, 4, 4);
        bytes.extend_from_slice(&0x0000u16.to_le_bytes());
        bytes.extend_from_slice(&0xFFFFu16.to_le_bytes());
        bytes.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        let img = decode_bytes(&bytes).unwrap();
        for p in img.pixels() {
            assert_eq!(p.0[3], 0);
        }
    }
}
