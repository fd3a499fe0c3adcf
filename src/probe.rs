//! Frame probe: the per-buffer callback on the on-screen display input
//!
//! For every buffer it walks the attached batch metadata, redacts faces and
//! license plates in place and writes the per-frame annotation file. It runs
//! on the streaming thread, so all work here is bounded and synchronous.

use log::{debug, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::annotation::{AnnotationWriter, FrameAnnotation};
use crate::metadata::{CLASS_FACE, CLASS_LICENSE_PLATE, FrameMeta};
use crate::pipeline::graph::{PadProbe, ProbeReturn};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::types::Buffer;
use crate::redaction;

/// Objects of one frame, counted by class
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ClassCounts {
    faces: usize,
    plates: usize,
    other: usize,
    redacted: usize,
}

impl ClassCounts {
    fn count(&mut self, class_id: i32, redacted: bool) {
        match class_id {
            CLASS_FACE => self.faces += 1,
            CLASS_LICENSE_PLATE => self.plates += 1,
            _ => self.other += 1,
        }
        if redacted {
            self.redacted += 1;
        }
    }

    fn total(&self) -> usize {
        self.faces + self.plates + self.other
    }
}

/// Per-buffer redaction callback
///
/// Owns the frame counter and the annotation output; one instance is
/// registered on the probed port.
pub struct FrameProbe {
    frame_number: AtomicU64,
    annotations: Option<AnnotationWriter>,
    health: Arc<PipelineHealth>,
}

impl FrameProbe {
    pub fn new(annotations: Option<AnnotationWriter>, health: Arc<PipelineHealth>) -> Self {
        Self {
            frame_number: AtomicU64::new(0),
            annotations,
            health,
        }
    }

    /// Number of buffers handled so far, which is also the number the next
    /// buffer will get
    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    pub fn annotations(&self) -> Option<&AnnotationWriter> {
        self.annotations.as_ref()
    }

    /// Handle one buffer. The buffer is always forwarded.
    pub fn on_frame(&self, buffer: &mut Buffer) -> ProbeReturn {
        let frame_number = self.frame_number.load(Ordering::Acquire);

        match buffer.batch_meta_mut() {
            Some(batch) => {
                self.health.record_frame(true);
                // frames of one batch share the buffer's number, the last one
                // leaves its lines in the file
                for frame in batch.frames_mut() {
                    self.process_frame(frame_number, frame);
                }
            }
            None => {
                debug!("Frame {}: no batch metadata attached", frame_number);
                self.health.record_frame(false);
            }
        }

        self.frame_number.fetch_add(1, Ordering::AcqRel);
        ProbeReturn::Continue
    }

    fn process_frame(&self, frame_number: u64, frame: &mut FrameMeta) {
        let mut file = self.open_annotation(frame_number);
        let mut counts = ClassCounts::default();

        for object in frame.objects_mut() {
            let plan = redaction::redact(object);
            counts.count(object.class_id, plan.is_redacted());

            let failed = match (file.as_mut(), plan.annotation.as_deref()) {
                (Some(out), Some(line)) => out
                    .write_line(line)
                    .err()
                    .map(|err| (out.path().to_path_buf(), err)),
                _ => None,
            };
            if let Some((path, err)) = failed {
                warn!("Failed to write {}: {}", path.display(), err);
                self.health.record_annotation(false);
                file = None;
            }
        }

        if let Some(out) = file {
            let path = out.path().to_path_buf();
            match out.finish() {
                Ok(lines) => {
                    trace!("Wrote {} annotation lines to {}", lines, path.display());
                    self.health.record_annotation(true);
                }
                Err(err) => {
                    warn!("Failed to close {}: {}", path.display(), err);
                    self.health.record_annotation(false);
                }
            }
        }

        self.health.record_objects(counts.total(), counts.redacted);
        trace!(
            "Frame {} (source {}): {} objects, faces={} plates={} other={}",
            frame_number,
            frame.source_id,
            counts.total(),
            counts.faces,
            counts.plates,
            counts.other
        );
    }

    fn open_annotation(&self, frame_number: u64) -> Option<FrameAnnotation> {
        let writer = self.annotations.as_ref()?;
        match writer.open(frame_number) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(
                    "Failed to open {}: {}",
                    writer.path_for(frame_number).display(),
                    err
                );
                self.health.record_annotation(false);
                None
            }
        }
    }
}

impl PadProbe for FrameProbe {
    fn on_buffer(&self, buffer: &mut Buffer) -> ProbeReturn {
        self.on_frame(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BatchMeta, ObjectMeta};
    use crate::redaction::{FACE_FILL, LICENSE_PLATE_FILL};
    use tempfile::tempdir;

    fn buffer_with(objects: Vec<ObjectMeta>) -> Buffer {
        Buffer::default().with_meta(BatchMeta::single(FrameMeta::new(0, 0, objects)))
    }

    fn objects(buffer: &Buffer) -> Vec<ObjectMeta> {
        buffer.batch_meta().unwrap().frames().next().unwrap().objects.clone()
    }

    #[test]
    fn test_annotation_example() {
        let dir = tempdir().unwrap();
        let health = Arc::new(PipelineHealth::new());
        let probe = FrameProbe::new(Some(AnnotationWriter::new(dir.path())), health.clone());

        let mut buffer = buffer_with(vec![
            ObjectMeta::new(1, 10.0, 20.0, 30.0, 40.0),
            ObjectMeta::new(2, 0.0, 0.0, 5.0, 5.0),
        ]);
        assert_eq!(probe.on_frame(&mut buffer), ProbeReturn::Continue);

        let content = std::fs::read_to_string(dir.path().join("000000.txt")).unwrap();
        assert_eq!(
            content,
            "license_plate 0.0 0 0.0 10.00 20.00 40.00 60.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0\n"
        );
        assert_eq!(probe.frame_number(), 1);
        assert_eq!(health.objects_seen(), 2);
        assert_eq!(health.objects_redacted(), 1);
        assert_eq!(health.annotation_files(), 1);
    }

    #[test]
    fn test_redacts_in_place() {
        let probe = FrameProbe::new(None, Arc::new(PipelineHealth::new()));
        let untouched = ObjectMeta::new(3, 1.0, 2.0, 3.0, 4.0).with_label("model");
        let mut buffer = buffer_with(vec![
            ObjectMeta::new(0, 0.0, 0.0, 8.0, 8.0).with_label("face"),
            ObjectMeta::new(1, 0.0, 0.0, 8.0, 8.0),
            untouched.clone(),
        ]);

        probe.on_frame(&mut buffer);
        let after = objects(&buffer);

        assert_eq!(after[0].rect_params.border_width, 0);
        assert!(after[0].rect_params.has_bg_color);
        assert_eq!(after[0].rect_params.bg_color, FACE_FILL);
        assert_eq!(after[0].text_params.font_params.font_size, 0);
        assert!(!after[0].text_params.set_bg_clr);

        assert_eq!(after[1].rect_params.border_width, 0);
        assert_eq!(after[1].rect_params.bg_color, LICENSE_PLATE_FILL);

        assert_eq!(after[2], untouched);
    }

    #[test]
    fn test_counter_without_metadata() {
        let dir = tempdir().unwrap();
        let health = Arc::new(PipelineHealth::new());
        let probe = FrameProbe::new(Some(AnnotationWriter::new(dir.path())), health.clone());

        for expected in 0..3 {
            assert_eq!(probe.frame_number(), expected);
            let mut buffer = Buffer::new(vec![0u8; 4]);
            assert_eq!(probe.on_frame(&mut buffer), ProbeReturn::Continue);
            assert_eq!(buffer.size(), 4);
        }

        assert_eq!(probe.frame_number(), 3);
        assert_eq!(health.frames_without_meta(), 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_counter_mixed_content() {
        let dir = tempdir().unwrap();
        let probe = FrameProbe::new(
            Some(AnnotationWriter::new(dir.path())),
            Arc::new(PipelineHealth::new()),
        );

        probe.on_frame(&mut buffer_with(vec![]));
        probe.on_frame(&mut Buffer::default());
        probe.on_frame(&mut buffer_with(vec![ObjectMeta::new(0, 1.5, 2.9, 3.0, 4.0)]));

        assert_eq!(probe.frame_number(), 3);
        assert_eq!(std::fs::read_to_string(dir.path().join("000000.txt")).unwrap(), "");
        assert!(!dir.path().join("000001.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("000002.txt")).unwrap(),
            "face 0.0 0 0.0 1.00 2.00 4.00 6.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0\n"
        );
    }

    #[test]
    fn test_last_batch_frame_owns_file() {
        let dir = tempdir().unwrap();
        let probe = FrameProbe::new(
            Some(AnnotationWriter::new(dir.path())),
            Arc::new(PipelineHealth::new()),
        );

        let mut batch = BatchMeta::new(2);
        batch.push_frame(FrameMeta::new(0, 0, vec![ObjectMeta::new(0, 0.0, 0.0, 1.0, 1.0)]));
        batch.push_frame(FrameMeta::new(0, 1, vec![ObjectMeta::new(1, 2.0, 2.0, 1.0, 1.0)]));
        probe.on_frame(&mut Buffer::default().with_meta(batch));

        let content = std::fs::read_to_string(dir.path().join("000000.txt")).unwrap();
        assert_eq!(
            content,
            "license_plate 0.0 0 0.0 2.00 2.00 3.00 3.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0\n"
        );
        assert_eq!(probe.frame_number(), 1);
        assert_eq!(probe.health.annotation_files(), 2);
    }

    #[test]
    fn test_file_is_truncated() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("000000.txt"), "stale\n").unwrap();
        let probe = FrameProbe::new(
            Some(AnnotationWriter::new(dir.path())),
            Arc::new(PipelineHealth::new()),
        );

        probe.on_frame(&mut buffer_with(vec![ObjectMeta::new(2, 0.0, 0.0, 1.0, 1.0)]));
        assert_eq!(std::fs::read_to_string(dir.path().join("000000.txt")).unwrap(), "");
    }

    #[test]
    fn test_unwritable_dir_keeps_streaming() {
        let dir = tempdir().unwrap();
        let health = Arc::new(PipelineHealth::new());
        let probe = FrameProbe::new(
            Some(AnnotationWriter::new(dir.path().join("missing"))),
            health.clone(),
        );

        let mut buffer = buffer_with(vec![ObjectMeta::new(1, 0.0, 0.0, 1.0, 1.0)]);
        assert_eq!(probe.on_frame(&mut buffer), ProbeReturn::Continue);
        assert_eq!(objects(&buffer)[0].rect_params.bg_color, LICENSE_PLATE_FILL);
        assert_eq!(health.annotation_failures(), 1);
        assert_eq!(probe.frame_number(), 1);
    }
}
