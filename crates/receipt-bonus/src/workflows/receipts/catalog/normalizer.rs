use deunicode::deunicode;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const CURRENCY_SYMBOLS: [(char, &str); 5] = [
    ('₴', "uah"),
    ('$', "usd"),
    ('€', "eur"),
    ('£', "gbp"),
    ('₽', "rub"),
];

/// Split words on these; `-` stays inside compound product names.
const SEPARATORS: [char; 14] = [
    ',', ';', ':', '.', '(', ')', '[', ']', '/', '\\', '"', '*', '«', '»',
];

/// Case-fold, strip diacritics, unify currency symbols, split glued punctuation and collapse
/// whitespace.
pub(crate) fn normalize_text(value: &str) -> String {
    let chars: Vec<char> = value
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .filter(|ch| !matches!(ch, '\u{feff}' | '\u{200b}'))
        .collect();

    let mut spaced = String::with_capacity(value.len());
    for (index, &ch) in chars.iter().enumerate() {
        if SEPARATORS.contains(&ch) && !is_decimal_mark(&chars, index) {
            spaced.push(' ');
            continue;
        }
        match CURRENCY_SYMBOLS.iter().find(|(symbol, _)| *symbol == ch) {
            Some((_, code)) => {
                spaced.push(' ');
                spaced.push_str(code);
                spaced.push(' ');
            }
            None => spaced.extend(ch.to_lowercase()),
        }
    }

    spaced
        .split_whitespace()
        .map(unify_currency_word)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Latin rendering of already normalised text, so "Дарниця" and "Darnitsia" meet.
pub(crate) fn transliterate(normalized: &str) -> String {
    let latin: String = deunicode(normalized)
        .chars()
        .filter(|ch| !matches!(ch, '\'' | '`'))
        .collect();
    normalize_text(&latin)
}

/// `.` or `,` between two digits is part of a number ("45.00", "12,5").
fn is_decimal_mark(chars: &[char], index: usize) -> bool {
    let digit_at = |at: Option<usize>| {
        at.and_then(|at| chars.get(at))
            .is_some_and(|ch| ch.is_ascii_digit())
    };
    matches!(chars[index], '.' | ',') && digit_at(index.checked_sub(1)) && digit_at(Some(index + 1))
}

fn unify_currency_word(word: &str) -> &str {
    match word {
        "грн" | "гривень" | "hrn" | "uah" => "uah",
        other => other,
    }
}
