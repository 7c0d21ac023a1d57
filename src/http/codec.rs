//! Reading a message head off a connection.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::http::ParseError;

/// Read until `parse` accepts a complete head.
///
/// Bytes past the head stay in `buf`. A close before any byte arrived is
/// `Ok(None)`; a close mid-head is `ParseError::Incomplete`.
pub async fn read_head<R, T, F>(
    reader: &mut R,
    buf: &mut BytesMut,
    limit: usize,
    parse: F,
) -> Result<Option<T>, ParseError>
where
    R: AsyncRead + Unpin + ?Sized,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>, ParseError>,
{
    loop {
        if !buf.is_empty() {
            if let Some((head, len)) = parse(&buf[..])? {
                buf.advance(len);
                return Ok(Some(head));
            }
            if buf.len() >= limit {
                return Err(ParseError::TooLarge { limit });
            }
        }

        buf.reserve(4096);
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ParseError::Incomplete)
            };
        }
    }
}
