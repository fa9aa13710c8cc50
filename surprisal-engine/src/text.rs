use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Unicode normalization applied to texts before tokenization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Leave text untouched
    #[default]
    None,
    Nfc,
    /// Compatibility composition.
    ///
    /// Needed for vocabularies without full-width ASCII: characters like
    /// `（` or `！` otherwise fall back to the unknown token and inflate
    /// surprisal.
    Nfkc,
}

/// Normalize `text`, borrowing when no change is requested.
pub fn normalize(text: &str, mode: Normalization) -> Cow<'_, str> {
    match mode {
        Normalization::None => Cow::Borrowed(text),
        Normalization::Nfc => Cow::Owned(text.nfc().collect()),
        Normalization::Nfkc => Cow::Owned(text.nfkc().collect()),
    }
}
