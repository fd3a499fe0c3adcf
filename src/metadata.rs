//! Detection metadata attached to buffers by the inference stage
//!
//! A batch holds one or more frames, each frame holds the objects the
//! detector reported for it. Rendering parameters (rectangle, label text,
//! colors) are read by the on-screen display stage downstream, so redaction
//! works by mutating them in place.
//!
//! The model is an owned, bounds-checked view produced by the inference
//! binding layer. Nothing in this crate walks native metadata lists.

use serde::{Deserialize, Serialize};

/// Class id reported by the face / license-plate detector for faces
pub const CLASS_FACE: i32 = 0;

/// Class id reported by the face / license-plate detector for license plates
pub const CLASS_LICENSE_PLATE: i32 = 1;

/// Class labels of the detector, indexed by class id
pub const CLASS_LABELS: [&str; 4] = ["face", "license_plate", "make", "model"];

/// Look up the label of a class id
///
/// Returns `None` for ids outside the detector's configured class set.
pub fn class_label(class_id: i32) -> Option<&'static str> {
    usize::try_from(class_id)
        .ok()
        .and_then(|index| CLASS_LABELS.get(index).copied())
}

/// RGBA color, each channel in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ColorParams {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub alpha: f64,
}

impl ColorParams {
    pub const fn new(red: f64, green: f64, blue: f64, alpha: f64) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }
}

/// Rectangle drawn around a detection, in pixel space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectParams {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default = "default_border_width")]
    pub border_width: u32,
    #[serde(default)]
    pub border_color: ColorParams,
    #[serde(default)]
    pub has_bg_color: bool,
    #[serde(default)]
    pub bg_color: ColorParams,
}

fn default_border_width() -> u32 {
    3
}

impl RectParams {
    /// Rectangle with default border and no background fill
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
            border_width: default_border_width(),
            border_color: ColorParams::new(1.0, 0.0, 0.0, 1.0),
            has_bg_color: false,
            bg_color: ColorParams::default(),
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }
}

/// Font used to render a label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontParams {
    #[serde(default = "default_font_name")]
    pub font_name: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default)]
    pub font_color: ColorParams,
}

fn default_font_name() -> String {
    "Serif".to_string()
}

fn default_font_size() -> u32 {
    10
}

impl Default for FontParams {
    fn default() -> Self {
        Self {
            font_name: default_font_name(),
            font_size: default_font_size(),
            font_color: ColorParams::new(1.0, 1.0, 1.0, 1.0),
        }
    }
}

/// Label drawn next to a detection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TextParams {
    #[serde(default)]
    pub display_text: Option<String>,
    #[serde(default)]
    pub x_offset: u32,
    #[serde(default)]
    pub y_offset: u32,
    #[serde(default)]
    pub font_params: FontParams,
    #[serde(default)]
    pub set_bg_clr: bool,
    #[serde(default)]
    pub text_bg_clr: ColorParams,
}

/// One object reported by the detector for a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub class_id: i32,
    #[serde(default)]
    pub confidence: f32,
    pub rect_params: RectParams,
    #[serde(default)]
    pub text_params: TextParams,
}

impl ObjectMeta {
    /// Object with the given class and geometry, no label
    pub fn new(class_id: i32, left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            class_id,
            confidence: 1.0,
            rect_params: RectParams::new(left, top, width, height),
            text_params: TextParams::default(),
        }
    }

    /// Attach a display label
    pub fn with_label(mut self, text: impl Into<String>) -> Self {
        self.text_params.display_text = Some(text.into());
        self.text_params.set_bg_clr = true;
        self
    }

    pub fn has_label(&self) -> bool {
        self.text_params.display_text.is_some()
    }
}

/// Detection results for one frame of the batch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Frame number as counted by the muxer for its source
    pub frame_num: u64,
    /// Index of the source stream inside the batch
    pub source_id: u32,
    /// Position of the frame inside the batch
    pub batch_id: u32,
    pub objects: Vec<ObjectMeta>,
}

impl FrameMeta {
    pub fn new(frame_num: u64, source_id: u32, objects: Vec<ObjectMeta>) -> Self {
        Self {
            frame_num,
            source_id,
            batch_id: 0,
            objects,
        }
    }

    /// Objects in detector order
    pub fn objects(&self) -> impl Iterator<Item = &ObjectMeta> {
        self.objects.iter()
    }

    /// Objects in detector order, for in-place mutation
    pub fn objects_mut(&mut self) -> impl Iterator<Item = &mut ObjectMeta> {
        self.objects.iter_mut()
    }
}

/// Metadata attached to a batched buffer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchMeta {
    /// Maximum number of frames the muxer puts in one batch
    pub max_frames_in_batch: u32,
    pub frames: Vec<FrameMeta>,
}

impl BatchMeta {
    pub fn new(max_frames_in_batch: u32) -> Self {
        Self {
            max_frames_in_batch,
            frames: Vec::new(),
        }
    }

    /// Batch holding a single frame
    pub fn single(frame: FrameMeta) -> Self {
        Self {
            max_frames_in_batch: 1,
            frames: vec![frame],
        }
    }

    pub fn push_frame(&mut self, mut frame: FrameMeta) {
        frame.batch_id = self.frames.len() as u32;
        self.frames.push(frame);
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> impl Iterator<Item = &FrameMeta> {
        self.frames.iter()
    }

    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut FrameMeta> {
        self.frames.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_labels() {
        assert_eq!(class_label(CLASS_FACE), Some("face"));
        assert_eq!(class_label(CLASS_LICENSE_PLATE), Some("license_plate"));
        assert_eq!(class_label(3), Some("model"));
        assert_eq!(class_label(4), None);
        assert_eq!(class_label(-1), None);
    }

    #[test]
    fn test_rect_edges() {
        let rect = RectParams::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(rect.right(), 40.0);
        assert_eq!(rect.bottom(), 60.0);
        assert!(!rect.has_bg_color);
        assert_eq!(rect.border_width, 3);
    }

    #[test]
    fn test_batch_ids_follow_insertion_order() {
        let mut batch = BatchMeta::new(4);
        batch.push_frame(FrameMeta::new(7, 0, Vec::new()));
        batch.push_frame(FrameMeta::new(7, 1, Vec::new()));

        let ids: Vec<u32> = batch.frames().map(|f| f.batch_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(batch.num_frames(), 2);
    }

    #[test]
    fn test_object_from_json_uses_defaults() {
        let json = r#"{"class_id":1,"rect_params":{"left":1,"top":2,"width":3,"height":4}}"#;
        let object: ObjectMeta = serde_json::from_str(json).unwrap();

        assert_eq!(object.class_id, CLASS_LICENSE_PLATE);
        assert_eq!(object.rect_params.border_width, 3);
        assert!(!object.has_label());
        assert_eq!(object.text_params.font_params.font_size, 10);
    }
}
