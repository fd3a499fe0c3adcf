//! Per-frame annotation files
//!
//! One text file per frame, named after the zero-padded frame number, holding
//! one bounding-box line per redacted object.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Creates the annotation file of each frame inside a directory
#[derive(Debug, Clone)]
pub struct AnnotationWriter {
    dir: PathBuf,
}

impl AnnotationWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<frame_number:06>.txt`
    pub fn path_for(&self, frame_number: u64) -> PathBuf {
        self.dir.join(format!("{:06}.txt", frame_number))
    }

    /// Create the file of a frame, truncating any previous content
    pub fn open(&self, frame_number: u64) -> io::Result<FrameAnnotation> {
        let path = self.path_for(frame_number);
        let file = File::create(&path)?;

        Ok(FrameAnnotation {
            path,
            writer: BufWriter::new(file),
            lines: 0,
        })
    }
}

/// An open annotation file
///
/// Dropping it closes the file; `finish` does the same but reports flush errors.
#[derive(Debug)]
pub struct FrameAnnotation {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
}

impl FrameAnnotation {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Append one newline-terminated line
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.lines += 1;
        Ok(())
    }

    /// Flush and close, returning the number of lines written
    pub fn finish(mut self) -> io::Result<usize> {
        self.writer.flush()?;
        Ok(self.lines)
    }
}
