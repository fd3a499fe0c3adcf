//! Redaction pass
//!
//! Maps a detection to the rendering mutation that hides it and to the
//! annotation line describing it. Planning is pure; applying the plan is the
//! only place object metadata is written.

use crate::metadata::{CLASS_FACE, CLASS_LICENSE_PLATE, ColorParams, ObjectMeta, RectParams, class_label};

/// Fill used to cover license plates
pub const LICENSE_PLATE_FILL: ColorParams = ColorParams::new(0.5, 0.0, 0.5, 1.0);

/// Skin-tone fill used to cover faces
pub const FACE_FILL: ColorParams = ColorParams::new(0.92, 0.75, 0.56, 1.0);

/// Opaque patch for the classes that must be redacted
pub fn patch_for(class_id: i32) -> Option<ColorParams> {
    match class_id {
        CLASS_LICENSE_PLATE => Some(LICENSE_PLATE_FILL),
        CLASS_FACE => Some(FACE_FILL),
        _ => None,
    }
}

/// Change to apply to an object's rendering parameters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderMutation {
    /// Hide the label box: no background highlight, zero font size
    pub hide_label: bool,
    /// Replace the border with a filled patch of this color
    pub patch: Option<ColorParams>,
}

impl RenderMutation {
    /// Write the mutation into the object's rendering parameters
    pub fn apply(&self, object: &mut ObjectMeta) {
        if self.hide_label {
            object.text_params.set_bg_clr = false;
            object.text_params.font_params.font_size = 0;
        }
        if let Some(fill) = self.patch {
            let rect = &mut object.rect_params;
            rect.border_width = 0;
            rect.has_bg_color = true;
            rect.bg_color = fill;
        }
    }
}

/// Outcome of planning the redaction of one object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RedactionPlan {
    pub mutation: RenderMutation,
    /// Annotation line (newline terminated) for the per-frame file
    pub annotation: Option<String>,
}

impl RedactionPlan {
    pub fn is_redacted(&self) -> bool {
        self.mutation.patch.is_some()
    }
}

/// Plan the redaction of an object without touching it
///
/// Objects of classes outside the redaction set get an empty plan: their
/// rendering stays as the detector left it and no annotation line is produced.
pub fn plan(object: &ObjectMeta) -> RedactionPlan {
    let Some(fill) = patch_for(object.class_id) else {
        return RedactionPlan::default();
    };

    RedactionPlan {
        mutation: RenderMutation {
            hide_label: object.has_label(),
            patch: Some(fill),
        },
        annotation: class_label(object.class_id)
            .map(|label| annotation_line(label, &object.rect_params)),
    }
}

/// Plan and apply the redaction of an object
pub fn redact(object: &mut ObjectMeta) -> RedactionPlan {
    let plan = plan(object);
    plan.mutation.apply(object);
    plan
}

/// Format one line of a per-frame bounding-box annotation file
///
/// Fifteen space separated fields: label, truncated, occluded, alpha, the box
/// as `left top right bottom`, then seven zeroed 3D fields. Box coordinates are
/// truncated towards zero and printed with a literal `.00` suffix.
pub fn annotation_line(label: &str, rect: &RectParams) -> String {
    let left = rect.left as f64;
    let top = rect.top as f64;
    let right = left + rect.width as f64;
    let bottom = top + rect.height as f64;

    format!(
        "{} 0.0 0 0.0 {}.00 {}.00 {}.00 {}.00 0.0 0.0 0.0 0.0 0.0 0.0 0.0\n",
        label,
        left.trunc() as i64,
        top.trunc() as i64,
        right.trunc() as i64,
        bottom.trunc() as i64,
    )
}
