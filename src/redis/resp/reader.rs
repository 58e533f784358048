use anyhow::Context;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::RespValue;

macro_rules! handle_eof {
    ($e:expr) => {
        match $e {
            Some(value) => value,
            None => return Ok(false),
        }
    };
}

macro_rules! check_eof {
    ($e:expr) => {
        if !$e {
            return Ok(false);
        }
    };
}

/// Incremental RESP frame decoder. Bytes accumulate in an internal buffer; a
/// non-consuming completeness check runs first and the frame is only split
/// off once it is whole. Lengths are authoritative: bulk payloads may contain
/// CR, LF, `$`, or any other byte.
pub struct RespReader<R> {
    inner: R,
    buf: BytesMut,
    cursor: usize,
}

impl<R: AsyncRead + Unpin> RespReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            cursor: 0,
        }
    }

    /// Reads one complete frame. `Ok(None)` is a clean disconnect on a frame
    /// boundary; a disconnect inside a partial frame is an error.
    pub async fn read_frame(&mut self) -> anyhow::Result<Option<RespValue>> {
        loop {
            self.cursor = 0;
            if !self.buf.is_empty() && self.check_frame()? {
                return Ok(Some(self.parse_frame()));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }

                anyhow::bail!("connection closed inside a partial frame");
            }
        }
    }

    /// Reads the snapshot transfer form `$<len>\r\n<len bytes>`, which has no
    /// trailing CRLF unlike a bulk string.
    pub async fn read_rdb_payload(&mut self) -> anyhow::Result<Bytes> {
        loop {
            self.cursor = 0;
            if !self.buf.is_empty() && self.check_rdb_payload()? {
                return Ok(self.parse_rdb_payload());
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                anyhow::bail!("connection closed before the snapshot payload completed");
            }
        }
    }

    fn check_frame(&mut self) -> anyhow::Result<bool> {
        let tag = handle_eof!(self.advance());
        match tag {
            b'+' | b'-' => self.check_line(),
            b'$' => self.check_bulk_string(),
            b'*' => self.check_array(),
            tag => Err(anyhow::anyhow!(
                "unexpected data tag '{}'",
                tag.escape_ascii()
            )),
        }
    }

    fn parse_frame(&mut self) -> RespValue {
        let tag = self.buf[0];
        self.buf.advance(1);
        match tag {
            b'+' => RespValue::SimpleString(self.parse_line()),
            b'-' => RespValue::SimpleError(self.parse_line()),
            b'$' => self.parse_bulk_string(),
            b'*' => self.parse_array(),
            _ => unreachable!(),
        }
    }

    fn check_line(&mut self) -> anyhow::Result<bool> {
        loop {
            if handle_eof!(self.advance()) == b'\r' {
                self.cursor -= 1;
                break;
            }
        }

        self.check_crlf()
    }

    fn parse_line(&mut self) -> Bytes {
        let length = self
            .buf
            .iter()
            .position(|&byte| byte == b'\r')
            .unwrap_or(0);
        let bytes = self.buf.copy_to_bytes(length);
        self.buf.advance(2);
        bytes
    }

    fn check_bulk_string(&mut self) -> anyhow::Result<bool> {
        let length = match handle_eof!(self.check_length()?) {
            -1 => return self.check_crlf(),
            length if length < -1 => {
                anyhow::bail!("bulk string length must be >= -1 but got '{length}'")
            }
            length => length as usize,
        };

        check_eof!(self.check_crlf()?);
        if length > 0 && self.buf.get(self.cursor + length - 1).is_none() {
            return Ok(false);
        }

        self.cursor += length;
        self.check_crlf()
    }

    fn parse_bulk_string(&mut self) -> RespValue {
        let length = self.parse_length();
        if length == -1 {
            return RespValue::NullBulkString;
        }

        let bytes = self.buf.copy_to_bytes(length as usize);
        self.buf.advance(2);
        RespValue::BulkString(bytes)
    }

    fn check_array(&mut self) -> anyhow::Result<bool> {
        let length = handle_eof!(self.check_length()?);
        if length < 0 {
            anyhow::bail!("array length must be non-negative but got '{length}'");
        }

        check_eof!(self.check_crlf()?);
        for _ in 0..length {
            check_eof!(self.check_frame()?);
        }

        Ok(true)
    }

    fn parse_array(&mut self) -> RespValue {
        let length = self.parse_length();
        let values = (0..length).map(|_| self.parse_frame()).collect();
        RespValue::Array(values)
    }

    fn check_rdb_payload(&mut self) -> anyhow::Result<bool> {
        let tag = handle_eof!(self.advance());
        if tag != b'$' {
            anyhow::bail!(
                "unexpected data tag '{}' for a snapshot payload",
                tag.escape_ascii()
            );
        }

        let length = match handle_eof!(self.check_length()?) {
            length if length < 0 => {
                anyhow::bail!("snapshot payload length must be non-negative")
            }
            length => length as usize,
        };

        check_eof!(self.check_crlf()?);
        if length > 0 && self.buf.get(self.cursor + length - 1).is_none() {
            return Ok(false);
        }

        self.cursor += length;
        Ok(true)
    }

    fn parse_rdb_payload(&mut self) -> Bytes {
        self.buf.advance(1);
        let length = self.parse_length();
        self.buf.copy_to_bytes(length as usize)
    }

    /// Validates the digits of a length field and returns its value, or
    /// `None` when more bytes are needed. The cursor stops on the CR.
    fn check_length(&mut self) -> anyhow::Result<Option<i64>> {
        let negative = match self.advance() {
            Some(b'-') => true,
            Some(byte) if byte.is_ascii_digit() => {
                self.cursor -= 1;
                false
            }
            Some(byte) => anyhow::bail!(
                "expected a length but got '{}'",
                byte.escape_ascii()
            ),
            None => return Ok(None),
        };

        let start = self.cursor;
        loop {
            match self.advance() {
                Some(byte) if byte.is_ascii_digit() => {}
                Some(_) => {
                    self.cursor -= 1;
                    break;
                }
                None => return Ok(None),
            }
        }

        let digits = std::str::from_utf8(&self.buf[start..self.cursor])
            .context("length is not valid utf-8")?;
        let length = digits
            .parse::<i64>()
            .with_context(|| format!("'{digits}' is not a valid length"))?;

        Ok(Some(if negative { -length } else { length }))
    }

    fn parse_length(&mut self) -> i64 {
        let negative = self.buf[0] == b'-';
        if negative {
            self.buf.advance(1);
        }

        let mut length = 0i64;
        while self.buf[0].is_ascii_digit() {
            length = length * 10 + i64::from(self.buf[0] - b'0');
            self.buf.advance(1);
        }

        self.buf.advance(2);
        if negative {
            -length
        } else {
            length
        }
    }

    fn check_crlf(&mut self) -> anyhow::Result<bool> {
        let cr = handle_eof!(self.advance());
        if cr != b'\r' {
            anyhow::bail!(
                "expected carriage return byte but got '{}'",
                cr.escape_ascii()
            );
        }

        let lf = handle_eof!(self.advance());
        if lf != b'\n' {
            anyhow::bail!("expected line feed byte but got '{}'", lf.escape_ascii());
        }

        Ok(true)
    }

    fn advance(&mut self) -> Option<u8> {
        self.cursor += 1;
        self.buf.get(self.cursor - 1).copied()
    }
}
