//! Fixed feeling-to-glyph vocabulary.

/// Every feeling the model may pick, with the reaction glyph sent for it.
pub const FEELINGS: [(&str, &str); 10] = [
    ("laugh", "\u{1F602}"),
    ("love", "\u{2764}\u{FE0F}"),
    ("like", "\u{1F44D}"),
    ("dislike", "\u{1F44E}"),
    ("celebrate", "\u{1F389}"),
    ("thinking", "\u{1F914}"),
    ("happy", "\u{1F60A}"),
    ("watching", "\u{1F440}"),
    ("sleepy", "\u{1F634}"),
    ("sad", "\u{1F622}"),
];

/// The always-available "no reaction" choice.
pub const NO_FEELING: &str = "none";

pub fn glyph(feeling: &str) -> Option<&'static str> {
    FEELINGS
        .iter()
        .find(|(name, _)| *name == feeling)
        .map(|(_, glyph)| *glyph)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    FEELINGS.iter().map(|(name, _)| *name)
}

pub fn is_known(feeling: &str) -> bool {
    feeling == NO_FEELING || glyph(feeling).is_some()
}
