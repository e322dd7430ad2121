/// 1x1 transparent GIF served by the open beacon. 43 bytes, built once
/// at compile time; mail clients cache-bust on their own so the response
/// also carries `Cache-Control: no-store`.
pub const TRACKING_PIXEL: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, // GIF89a
    0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, // 1x1, global color table
    0x00, 0x00, 0x00, 0xff, 0xff, 0xff, // black, white
    0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, // GCE: color 0 transparent
    0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, // image descriptor
    0x02, 0x02, 0x44, 0x01, 0x00, // pixel data
    0x3b, // trailer
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_is_a_valid_gif89a() {
        assert_eq!(&TRACKING_PIXEL[..6], b"GIF89a");
        assert_eq!(TRACKING_PIXEL.len(), 43);
        assert_eq!(*TRACKING_PIXEL.last().unwrap(), 0x3b);
    }
}
