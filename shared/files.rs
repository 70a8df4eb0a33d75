use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How a text input is compressed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCompression {
    Plain,
    Gzip,
    /// Decide from the file's first two bytes.
    Detect,
}

/// Sequential, line-oriented access to a text file regardless of its compression.
pub trait TextSource: Send {
    /// Returns the next line without its `\n` or `\r\n` terminator, or `None` at end of
    /// input. The slice is valid until the next call.
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>>;

    /// Human-readable origin, used in error messages.
    fn describe(&self) -> &str;
}

struct ReaderTextSource<R> {
    reader: R,
    line: Vec<u8>,
    line_active: bool,
    path_display: String,
}

impl<R: BufRead + Send> ReaderTextSource<R> {
    fn new(reader: R, path_display: String) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(4096),
            line_active: false,
            path_display,
        }
    }
}

impl<R: BufRead + Send> TextSource for ReaderTextSource<R> {
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>> {
        if self.line_active {
            self.line.clear();
            self.line_active = false;
        }

        let bytes_read = self.reader.read_until(b'\n', &mut self.line).map_err(|e| {
            io::Error::new(e.kind(), format!("Error reading {}: {e}", self.path_display))
        })?;
        if bytes_read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        self.line_active = true;
        Ok(Some(&self.line))
    }

    fn describe(&self) -> &str {
        &self.path_display
    }
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(magic == GZIP_MAGIC)
}

/// Opens a local text file, transparently decompressing gzip and bgzip input.
pub fn open_text_source(
    path: &Path,
    compression: TextCompression,
) -> io::Result<Box<dyn TextSource>> {
    let gzipped = match compression {
        TextCompression::Plain => false,
        TextCompression::Gzip => true,
        TextCompression::Detect => is_gzip(path)?,
    };
    let file = File::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("Opening {}: {e}", path.display())))?;
    let display = path.display().to_string();
    if gzipped {
        let reader = BufReader::with_capacity(1 << 16, MultiGzDecoder::new(file));
        Ok(Box::new(ReaderTextSource::new(reader, display)))
    } else {
        let reader = BufReader::with_capacity(1 << 16, file);
        Ok(Box::new(ReaderTextSource::new(reader, display)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn drain(source: &mut dyn TextSource) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = source.next_line().unwrap() {
            lines.push(String::from_utf8(line.to_vec()).unwrap());
        }
        lines
    }

    #[test]
    fn plain_lines_lose_their_terminators() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"a\r\nbb\n\nccc").unwrap();
        let mut source = open_text_source(file.path(), TextCompression::Plain).unwrap();
        assert_eq!(drain(source.as_mut()), vec!["a", "bb", "", "ccc"]);
    }

    #[test]
    fn gzip_is_detected_from_content() {
        let mut file = NamedTempFile::new().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(b"##header\nrow\n").unwrap();
        file.write_all(&encoder.finish().unwrap()).unwrap();

        let mut source = open_text_source(file.path(), TextCompression::Detect).unwrap();
        assert_eq!(drain(source.as_mut()), vec!["##header", "row"]);
        assert!(source.describe().ends_with(
            file.path().file_name().unwrap().to_str().unwrap()
        ));
    }

    #[test]
    fn short_plain_file_is_not_mistaken_for_gzip() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        let mut source = open_text_source(file.path(), TextCompression::Detect).unwrap();
        assert_eq!(drain(source.as_mut()), vec!["x"]);
    }
}
