//! Line tokenizer for streamed command output

use std::io::{self, Read};

const CHUNK_SIZE: usize = 4096;

/// Feed every line read from `reader` to `handler` as it arrives.
///
/// Lines end at `\n` or `\r`, are trimmed, and empty ones are dropped.
/// A final unterminated line is delivered at EOF, and also before a read
/// error is returned.
pub fn for_each_line<R, F>(mut reader: R, mut handler: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(&str),
{
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut pending = Vec::new();

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                emit(&pending, &mut handler);
                return Err(e);
            }
        };

        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                emit(&pending, &mut handler);
                pending.clear();
            } else {
                pending.push(byte);
            }
        }
    }

    emit(&pending, &mut handler);
    Ok(())
}

fn emit<F: FnMut(&str)>(bytes: &[u8], handler: &mut F) {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    if !line.is_empty() {
        handler(line);
    }
}
