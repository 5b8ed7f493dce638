// Text Processing Service
// Canonical text forms used for matching: normalized text and Hangul consonant skeleton

use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

use crate::models::Locale;

/// Character class treated as insertable noise between the letters of a word:
/// whitespace, separators, punctuation, symbols and format (zero-width / bidi) marks.
pub const NOISE_CLASS: &str = r"[\s\p{Z}\p{P}\p{S}\p{Cf}]";

/// Everything `normalize` strips: the noise class plus combining marks
static STRIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\s\p{Z}\p{P}\p{S}\p{Cf}\p{M}]+").expect("static strip pattern")
});

const HANGUL_SYLLABLE_BASE: u32 = 0xAC00;
const HANGUL_SYLLABLE_LAST: u32 = 0xD7A3;
/// 21 vowels * 28 finals
const SYLLABLES_PER_INITIAL: u32 = 588;
const FINAL_COUNT: u32 = 28;

/// Initial consonants in syllable index order (compatibility jamo)
const INITIALS: [char; 19] = [
    'ㄱ', 'ㄲ', 'ㄴ', 'ㄷ', 'ㄸ', 'ㄹ', 'ㅁ', 'ㅂ', 'ㅃ', 'ㅅ', 'ㅆ', 'ㅇ', 'ㅈ', 'ㅉ', 'ㅊ', 'ㅋ',
    'ㅌ', 'ㅍ', 'ㅎ',
];

/// Final consonants in syllable index order; index 0 is "no final"
const FINALS: [Option<char>; 28] = [
    None,
    Some('ㄱ'),
    Some('ㄲ'),
    Some('ㄳ'),
    Some('ㄴ'),
    Some('ㄵ'),
    Some('ㄶ'),
    Some('ㄷ'),
    Some('ㄹ'),
    Some('ㄺ'),
    Some('ㄻ'),
    Some('ㄼ'),
    Some('ㄽ'),
    Some('ㄾ'),
    Some('ㄿ'),
    Some('ㅀ'),
    Some('ㅁ'),
    Some('ㅂ'),
    Some('ㅄ'),
    Some('ㅅ'),
    Some('ㅆ'),
    Some('ㅇ'),
    Some('ㅈ'),
    Some('ㅊ'),
    Some('ㅋ'),
    Some('ㅌ'),
    Some('ㅍ'),
    Some('ㅎ'),
];

// Conjoining jamo blocks produced by NFD
const CONJOINING_INITIAL_FIRST: u32 = 0x1100;
const CONJOINING_INITIAL_LAST: u32 = 0x1112;
const CONJOINING_VOWEL_FIRST: u32 = 0x1161;
const CONJOINING_VOWEL_LAST: u32 = 0x1175;
const CONJOINING_FINAL_BASE: u32 = 0x11A7;
const CONJOINING_FINAL_LAST: u32 = 0x11C2;

/// Canonicalize text for matching: lowercase, NFD, strip marks, zero-width
/// characters and separators. Total and idempotent.
pub fn normalize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let decomposed: String = text.to_lowercase().nfd().collect();
    STRIP_RE.replace_all(&decomposed, "").into_owned()
}

/// Consonant skeleton: every Hangul syllable becomes its initial consonant
/// followed by its final consonant (if any). Vowels disappear; everything
/// else passes through unchanged.
pub fn skeleton(normalized: &str) -> String {
    let mut out = String::with_capacity(normalized.len());
    for c in normalized.chars() {
        let code = c as u32;
        match code {
            HANGUL_SYLLABLE_BASE..=HANGUL_SYLLABLE_LAST => {
                let index = code - HANGUL_SYLLABLE_BASE;
                out.push(INITIALS[(index / SYLLABLES_PER_INITIAL) as usize]);
                if let Some(fin) = FINALS[(index % FINAL_COUNT) as usize] {
                    out.push(fin);
                }
            }
            // Decomposed syllables (normalize emits NFD)
            CONJOINING_INITIAL_FIRST..=CONJOINING_INITIAL_LAST => {
                out.push(INITIALS[(code - CONJOINING_INITIAL_FIRST) as usize]);
            }
            CONJOINING_VOWEL_FIRST..=CONJOINING_VOWEL_LAST => {}
            0x11A8..=CONJOINING_FINAL_LAST => {
                if let Some(fin) = FINALS[(code - CONJOINING_FINAL_BASE) as usize] {
                    out.push(fin);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

pub fn is_hangul(c: char) -> bool {
    matches!(c as u32,
        HANGUL_SYLLABLE_BASE..=HANGUL_SYLLABLE_LAST
        | 0x1100..=0x11FF
        | 0x3131..=0x318E)
}

/// Text containing any Hangul is Korean; anything else is treated as English
pub fn detect_locale(text: &str) -> Locale {
    if text.chars().any(is_hangul) {
        Locale::Ko
    } else {
        Locale::En
    }
}

/// One input text with all derived forms computed once
#[derive(Debug, Clone)]
pub struct PreparedText<'a> {
    pub raw: &'a str,
    pub normalized: String,
    pub skeleton: String,
    pub locale: Locale,
}

impl<'a> PreparedText<'a> {
    pub fn new(raw: &'a str) -> Self {
        let normalized = normalize(raw);
        let skeleton = skeleton(&normalized);
        Self {
            raw,
            normalized,
            skeleton,
            locale: detect_locale(raw),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.raw.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_separators_and_case() {
        assert_eq!(normalize("S.i.B-a_L!"), "sibal");
        assert_eq!(normalize("  hello   World "), "helloworld");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \t\n"), "");
    }

    #[test]
    fn test_normalize_strips_zero_width_and_diacritics() {
        assert_eq!(normalize("f\u{200B}u\u{200D}c\u{FEFF}k"), "fuck");
        assert_eq!(normalize("café"), "cafe");
        assert_eq!(normalize("\u{202E}abc\u{202C}"), "abc");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "씨발 이자식아!!",
            "Ｆｕｌｌ　ｗｉｄｔｈ",
            "İstanbul Σίσυφος",
            "s.i.b.a.l",
            "\u{200B}ㅅ ㅂ\u{0301}",
            "MiXeD 한글 text 123 ?!",
            "",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_skeleton_of_precomposed_syllables() {
        assert_eq!(skeleton("씨발"), "ㅆㅂㄹ");
        assert_eq!(skeleton("병신"), "ㅂㅅㅅㄴ");
        assert_eq!(skeleton("가"), "ㄱ");
    }

    #[test]
    fn test_skeleton_of_normalized_text_matches_precomposed() {
        assert_eq!(skeleton(&normalize("씨 발")), skeleton("씨발"));
        assert_eq!(skeleton(&normalize("병.신")), "ㅂㅅㅅㄴ");
    }

    #[test]
    fn test_skeleton_passes_through_other_characters() {
        assert_eq!(skeleton("ㅅㅂ"), "ㅅㅂ");
        assert_eq!(skeleton("abc123"), "abc123");
        assert_eq!(skeleton("a가1"), "aㄱ1");
    }

    #[test]
    fn test_detect_locale() {
        assert_eq!(detect_locale("안녕하세요"), Locale::Ko);
        assert_eq!(detect_locale("hello 세상"), Locale::Ko);
        assert_eq!(detect_locale("hello"), Locale::En);
        assert_eq!(detect_locale("ㅅㅂ"), Locale::Ko);
    }
}
