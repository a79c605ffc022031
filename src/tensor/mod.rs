//! Pure image/tensor helpers shared by the engine and the orchestrator

mod mask;
mod preprocess;

pub use mask::{
    SelectionOp, SelectionOptions, apply_mask_to_selection, candidate_mask_from_logits,
    extract_previous_logits, resize_mask_binary, resize_mask_smooth, select_best_candidate,
    slice_candidate_logits,
};
pub use preprocess::{
    has_mask_tensor, mask_input_tensor, point_coords_tensor, point_labels_tensor,
    preprocess_image, scale_point,
};
