pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

/// File name for an uploaded render, so Telegram clients show the right type.
pub fn image_file_name(data: &[u8]) -> String {
    let extension = infer::get(data)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.extension())
        .unwrap_or("png");
    format!("generated_image.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_HEADER: [u8; 12] = [
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01,
    ];

    #[test]
    fn names_files_after_detected_format() {
        assert_eq!(image_file_name(&JPEG_HEADER), "generated_image.jpg");
        assert_eq!(detect_mime_type(&JPEG_HEADER).as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn unknown_bytes_default_to_png_name() {
        assert_eq!(image_file_name(b"hello"), "generated_image.png");
        assert_eq!(detect_mime_type(b"hello"), None);
    }
}
