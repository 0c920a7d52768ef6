use crate::error::GmdResult;
use crate::mem::PAGE_SIZE;
use std::io::{self, Read};

// Target amount of rendered text per fill pass.
const FILL_TARGET: usize = PAGE_SIZE;

/// A position-indexed sequence of renderable items.
///
/// Sources hold references to live objects only between `start` and
/// `stop`. [`SeqReader`] brackets every fill pass with that pair, so a
/// consumer that stops reading early (or hits an error) still releases
/// everything the pass acquired.
pub trait SeqSource {
    /// Positions the source at `pos`, acquiring whatever the item at that
    /// position needs. `Ok(false)` means the sequence is exhausted there.
    ///
    /// # Errors
    ///
    /// Access-control failures surface here, before any output exists.
    fn start(&mut self, pos: u64) -> GmdResult<bool>;

    /// Renders the current item. Rendering nothing is allowed; the
    /// position is consumed either way.
    ///
    /// # Errors
    ///
    /// Any render failure aborts the fill pass.
    fn show(&mut self, out: &mut String) -> GmdResult<()>;

    /// Steps to the next item. `Ok(false)` ends the sequence.
    ///
    /// # Errors
    ///
    /// Any step failure aborts the fill pass.
    fn next(&mut self) -> GmdResult<bool>;

    /// Releases whatever `start`/`next` acquired. Runs once per fill
    /// pass, on success and on failure alike, so it must tolerate being
    /// called when nothing is held.
    fn stop(&mut self);
}

/// Streams a [`SeqSource`] out through `std::io::Read`.
///
/// Rendered text is buffered between `read` calls; object references are
/// not. Each fill pass re-derives its position from the running item
/// ordinal, which makes reads restartable while the underlying data
/// mutates.
pub struct SeqReader<S> {
    source: S,
    pos: u64,
    buf: Vec<u8>,
    off: usize,
    done: bool,
}

impl<S: SeqSource> SeqReader<S> {
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source,
            pos: 0,
            buf: Vec::new(),
            off: 0,
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut out = String::new();
        let result = self.fill_pass(&mut out);
        self.source.stop();

        if result.is_err() {
            // A failed pass contributes nothing, not partial rows.
            out.clear();
        }
        self.buf = out.into_bytes();
        self.off = 0;
        result.map_err(io::Error::from)
    }

    fn fill_pass(&mut self, out: &mut String) -> GmdResult<()> {
        if !self.source.start(self.pos)? {
            self.done = true;
            return Ok(());
        }
        loop {
            self.source.show(out)?;
            self.pos += 1;

            if out.len() >= FILL_TARGET {
                return Ok(());
            }
            if !self.source.next()? {
                self.done = true;
                return Ok(());
            }
        }
    }
}

impl<S: SeqSource> Read for SeqReader<S> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        while self.off >= self.buf.len() {
            if self.done {
                return Ok(0);
            }
            self.fill()?;
        }

        let n = dst.len().min(self.buf.len() - self.off);
        dst[..n].copy_from_slice(&self.buf[self.off..self.off + n]);
        self.off += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GmdError;

    struct ScriptSource {
        rows: Vec<&'static str>,
        deny: bool,
        cur: usize,
        starts: usize,
        stops: usize,
    }

    impl ScriptSource {
        fn new(rows: Vec<&'static str>) -> Self {
            Self {
                rows,
                deny: false,
                cur: 0,
                starts: 0,
                stops: 0,
            }
        }
    }

    impl SeqSource for ScriptSource {
        fn start(&mut self, pos: u64) -> GmdResult<bool> {
            self.starts += 1;
            if self.deny {
                return Err(GmdError::PermissionDenied(1));
            }
            self.cur = pos as usize;
            Ok(self.cur < self.rows.len())
        }

        fn show(&mut self, out: &mut String) -> GmdResult<()> {
            out.push_str(self.rows[self.cur]);
            Ok(())
        }

        fn next(&mut self) -> GmdResult<bool> {
            self.cur += 1;
            Ok(self.cur < self.rows.len())
        }

        fn stop(&mut self) {
            self.stops += 1;
        }
    }

    fn read_all(reader: &mut SeqReader<ScriptSource>) -> String {
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_streams_all_rows_in_order() {
        let mut reader = SeqReader::new(ScriptSource::new(vec!["one\n", "two\n", "three\n"]));
        assert_eq!(read_all(&mut reader), "one\ntwo\nthree\n");
    }

    #[test]
    fn test_small_destination_buffers() {
        let mut reader = SeqReader::new(ScriptSource::new(vec!["alpha\n", "beta\n"]));
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"alpha\nbeta\n");
    }

    #[test]
    fn test_every_start_is_balanced_by_a_stop() {
        let mut reader = SeqReader::new(ScriptSource::new(vec!["a\n", "b\n"]));
        read_all(&mut reader);
        assert!(reader.source.starts > 0);
        assert_eq!(reader.source.starts, reader.source.stops);
    }

    #[test]
    fn test_empty_rows_do_not_end_the_stream() {
        let mut reader = SeqReader::new(ScriptSource::new(vec!["", "", "tail\n"]));
        assert_eq!(read_all(&mut reader), "tail\n");
    }

    #[test]
    fn test_denied_start_yields_error_and_no_bytes() {
        let mut source = ScriptSource::new(vec!["secret\n"]);
        source.deny = true;
        let mut reader = SeqReader::new(source);

        let mut out = String::new();
        let err = reader.read_to_string(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(out.is_empty());
        // The failed pass still ran its stop.
        assert_eq!(reader.source.starts, reader.source.stops);
    }

    #[test]
    fn test_empty_sequence_is_clean_eof() {
        let mut reader = SeqReader::new(ScriptSource::new(Vec::new()));
        assert_eq!(read_all(&mut reader), "");
    }
}
