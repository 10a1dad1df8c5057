//! Utility functions
//!
use std::{fs::File, io::Cursor};

use anyhow::Result;
use bytes::Bytes;
use reqwest::Client;

/// Boundary separating the parts of the MJPEG stream.
pub const MJPEG_BOUNDARY: &str = "frame";

/// Download a file from a URL to a given filepath.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<std::path::Path>,
) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;

    let mut file = File::create(filepath)?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}

/// Wrap a JPEG image as one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod test {
    use super::as_jpeg_stream_item;

    #[test]
    fn test_jpeg_stream_item_framing() {
        let item = as_jpeg_stream_item(&[0xff, 0xd8]);
        assert!(item.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(item.ends_with(&[0xff, 0xd8, b'\r', b'\n', b'\r', b'\n']));
    }
}
