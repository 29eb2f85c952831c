//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailroom.
//
// Mailroom is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailroom is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailroom. If not, see <http://www.gnu.org/licenses/>.

//! The SMTP/POP3 "dot-stuffing" transfer encoding (RFC 5321 § 4.5.2).
//!
//! A message is sent as a sequence of lines ending with a line consisting of
//! a single `.`; any other line starting with `.` has an extra `.` prepended.

use std::io::{self, Write};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Lines longer than this are passed through in pieces of this size.
const CHUNK: u64 = 65536;

/// Reads a dot-stuffed payload from `src` into `dst`, stopping after the
/// terminating `.` line, which is consumed but not written.
///
/// Lines ending with a bare LF are converted to CRLF. A line consisting of
/// `.` followed by a bare LF is also accepted as the terminator.
///
/// Returns the number of bytes written to `dst`.
pub async fn read_dot_stuffed(
    dst: &mut impl Write,
    src: &mut (impl AsyncBufRead + Unpin),
) -> io::Result<u64> {
    let mut line = Vec::with_capacity(1024);
    let mut start_of_line = true;
    let mut prev_cr = false;
    let mut written = 0u64;

    loop {
        line.clear();
        let nread = (&mut *src).take(CHUNK).read_until(b'\n', &mut line).await?;
        if 0 == nread {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in dot-stuffed payload",
            ));
        }

        let mut data = &line[..];
        if start_of_line {
            if b".\r\n" == data || b".\n" == data {
                break;
            }

            if b'.' == data[0] {
                data = &data[1..];
            }
        }

        let ends_line = line.ends_with(b"\n");
        let bare_lf = ends_line
            && !data.ends_with(b"\r\n")
            && !(b"\n" == data && prev_cr);
        if bare_lf {
            dst.write_all(&data[..data.len() - 1])?;
            dst.write_all(b"\r\n")?;
            written += data.len() as u64 + 1;
        } else {
            dst.write_all(data)?;
            written += data.len() as u64;
        }

        prev_cr = data.ends_with(b"\r");
        start_of_line = ends_line;
    }

    Ok(written)
}

/// Copies `src` into `dst`, applying CRLF-strict dot stuffing. The copy
/// includes the terminating `.` line, preceded by a CRLF if `src` did not end
/// with one.
pub async fn write_dot_stuffed(
    dst: &mut (impl tokio::io::AsyncWrite + Unpin),
    src: &mut impl io::BufRead,
) -> io::Result<()> {
    let mut dst = tokio::io::BufWriter::new(dst);
    let mut start_of_line = true;
    let mut prev_end = 0u8;

    loop {
        let mut buffer = src.fill_buf()?;
        if buffer.is_empty() {
            break;
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..eol + 1];
        }

        if start_of_line && Some(&b'.') == buffer.first() {
            dst.write_all(b".").await?;
        }
        dst.write_all(buffer).await?;

        let last = buffer[buffer.len() - 1];
        let prev = buffer
            .get(buffer.len().wrapping_sub(2))
            .copied()
            .unwrap_or(prev_end);
        start_of_line = b'\r' == prev && b'\n' == last;
        prev_end = last;

        let buffer_len = buffer.len();
        src.consume(buffer_len);
    }

    if !start_of_line {
        dst.write_all(b"\r\n").await?;
    }
    dst.write_all(b".\r\n").await?;
    dst.flush().await?;

    Ok(())
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn decode(stuffed: &[u8], buffer_size: usize) -> io::Result<Vec<u8>> {
        let mut decoded = Vec::<u8>::new();
        let mut reader =
            tokio::io::BufReader::with_capacity(buffer_size, stuffed);
        futures::executor::block_on(read_dot_stuffed(
            &mut decoded,
            &mut reader,
        ))?;
        Ok(decoded)
    }

    fn encode(content: &[u8], buffer_size: usize) -> Vec<u8> {
        // Boxed into a trait object so the buffering behaviour can't be
        // specialised away.
        let mut reader = io::BufReader::with_capacity(
            buffer_size,
            Box::new(content) as Box<dyn io::Read>,
        );
        let mut encoded = Vec::<u8>::new();
        futures::executor::block_on(write_dot_stuffed(
            &mut encoded,
            &mut reader,
        ))
        .unwrap();
        encoded
    }

    #[test]
    fn decode_simple() {
        assert_eq!(
            b"hello\r\n.world\r\n".to_vec(),
            decode(b"hello\r\n..world\r\n.\r\n", 64).unwrap(),
        );
        assert_eq!(b"".to_vec(), decode(b".\r\n", 64).unwrap());
        assert_eq!(
            b"a\r\n".to_vec(),
            decode(b"a\r\n.\r\ntrailing", 64).unwrap(),
        );
    }

    #[test]
    fn decode_bare_lf() {
        assert_eq!(
            b"one\r\ntwo\r\n".to_vec(),
            decode(b"one\ntwo\n.\n", 64).unwrap(),
        );
        assert_eq!(b"x\r\n".to_vec(), decode(b"x\r\n.\n", 1).unwrap());
    }

    #[test]
    fn decode_eof() {
        assert_eq!(
            io::ErrorKind::UnexpectedEof,
            decode(b"hello\r\n", 64).unwrap_err().kind(),
        );
        assert_eq!(
            io::ErrorKind::UnexpectedEof,
            decode(b"hello\r\n.", 64).unwrap_err().kind(),
        );
    }

    #[test]
    fn decode_long_lines() {
        let mut stuffed = "x".repeat(200_000);
        stuffed.push_str("\r\n.\r\n");
        let decoded = decode(stuffed.as_bytes(), 4096).unwrap();
        assert_eq!(200_002, decoded.len());
    }

    #[test]
    fn encode_simple() {
        assert_eq!(b".\r\n".to_vec(), encode(b"", 8));
        assert_eq!(b"..x\r\n.\r\n".to_vec(), encode(b".x", 8));
        assert_eq!(
            b"a\r\n..\r\nb\r\n.\r\n".to_vec(),
            encode(b"a\r\n.\r\nb", 8),
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 2048,
            ..ProptestConfig::default()
        })]

        #[test]
        fn binary_dot_stuffing_encodes_properly(
            content in "[x.\r\n]{1,100}",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            if !stuffed.ends_with("\r\n") {
                stuffed.push_str("\r\n");
            }
            stuffed.push_str(".\r\n");

            let actual = String::from_utf8(
                encode(content.as_bytes(), buffer_size)).unwrap();
            prop_assert_eq!(stuffed, actual);
        }

        #[test]
        fn dot_stuffing_round_trip(
            lines in prop::collection::vec("[x.\r]{0,12}", 0..20),
            encode_buffer in 1usize..=32,
            decode_buffer in 1usize..=32,
        ) {
            let mut content = String::new();
            for line in &lines {
                content.push_str(line);
                content.push_str("\r\n");
            }

            let encoded = encode(content.as_bytes(), encode_buffer);
            let decoded = decode(&encoded, decode_buffer).unwrap();
            prop_assert_eq!(content.as_bytes(), &decoded[..]);
        }
    }
}
