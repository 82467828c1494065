use crate::models::GenerationRequest;

/// Identity-preservation policy prepended to every frame prompt.
pub const IDENTITY_LOCK_PROMPT: &str = "STRICT IDENTITY PROTOCOL:
- SUBJECT: You MUST replicate the EXACT facial structure, skin tone, and features of the person in the reference image.
- CHARACTERISTICS: Keep the reference age, skin texture with natural visible pores, hair, eyes and lips exactly as photographed.
- NO VARIATION: Do not \"beautify\", do not slim the face, do not change the jawline. Any deviation from the reference identity is a failure.
- PHOTOGRAPHY: Casual smartphone RAW, slightly uneven lighting, candid framing, minor digital noise. No studio lighting.";

pub fn build_frame_prompt(request: &GenerationRequest, frame_index: u32) -> String {
    format!(
        "{IDENTITY_LOCK_PROMPT}\n\
         CURRENT FRAME: {frame} of {total}.\n\
         OUTFIT: {outfit} (High material realism, natural wrinkles).\n\
         LOCATION: {location}.\n\
         ACTION: Candid moment, looking away or subtle smile, phone-shot perspective.\n\
         STRICT: The face MUST be 100% identical to the reference image provided.",
        frame = frame_index + 1,
        total = request.frame_count,
        outfit = request.outfit.trim(),
        location = request.location.trim(),
    )
}
