use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Fixed 8-byte PNG file signature.
pub const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

const IHDR_LEN: u32 = 13;

pub fn has_signature(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && bytes[..8] == SIGNATURE
}

/// Structural check: signature, then an IHDR chunk of length 13 immediately
/// following (length field big-endian at offset 8, tag at 12..16).
pub fn validate_structure(bytes: &[u8]) -> bool {
    if bytes.len() < 16 || !has_signature(bytes) {
        return false;
    }
    let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    len == IHDR_LEN && &bytes[12..16] == b"IHDR"
}

/// Width/height from the IHDR chunk, without decoding pixel data.
pub fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || !validate_structure(bytes) {
        return None;
    }
    let w = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let h = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some((w, h))
}

/// Read just enough of a file to extract IHDR dimensions.
pub fn probe_file(path: &Path) -> io::Result<Option<(u32, u32)>> {
    let mut head = [0u8; 24];
    let mut f = File::open(path)?;
    let n = f.read(&mut head)?;
    Ok(dimensions(&head[..n]))
}

/// Signature-only check against the first bytes of a file.
pub fn file_has_signature(path: &Path) -> bool {
    let mut head = [0u8; 8];
    match File::open(path).and_then(|mut f| f.read(&mut head)) {
        Ok(n) => n == 8 && has_signature(&head),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_ihdr(w: u32, h: u32) -> Vec<u8> {
        let mut v = SIGNATURE.to_vec();
        v.extend_from_slice(&IHDR_LEN.to_be_bytes());
        v.extend_from_slice(b"IHDR");
        v.extend_from_slice(&w.to_be_bytes());
        v.extend_from_slice(&h.to_be_bytes());
        v
    }

    #[test]
    fn accepts_well_formed_header() {
        let bytes = minimal_ihdr(512, 256);
        assert!(validate_structure(&bytes));
        assert_eq!(dimensions(&bytes), Some((512, 256)));
    }

    #[test]
    fn rejects_bad_signature_and_ihdr() {
        let mut bytes = minimal_ihdr(512, 256);
        bytes[0] = 0;
        assert!(!validate_structure(&bytes));

        let mut bytes = minimal_ihdr(512, 256);
        bytes[11] = 14; // IHDR length != 13
        assert!(!validate_structure(&bytes));

        let mut bytes = minimal_ihdr(512, 256);
        bytes[12] = b'X';
        assert!(!validate_structure(&bytes));

        assert!(!validate_structure(&SIGNATURE));
    }

    #[test]
    fn real_encoder_output_passes() {
        let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 255]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let bytes = buf.into_inner();
        assert!(validate_structure(&bytes));
        assert_eq!(dimensions(&bytes), Some((8, 8)));
    }
}
