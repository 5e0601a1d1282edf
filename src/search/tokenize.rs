use std::collections::HashSet;
use std::sync::OnceLock;

/// Spanish stopwords, matched against tokens before stemming.
const STOPWORDS: &[&str] = &[
    "a", "al", "algo", "algunas", "algunos", "ante", "antes", "como", "con", "contra", "cual",
    "cuando", "de", "del", "desde", "donde", "durante", "e", "el", "ella", "ellas", "ellos", "en",
    "entre", "era", "esa", "esas", "ese", "eso", "esos", "esta", "estaba", "estado", "estar",
    "estas", "este", "esto", "estos", "fue", "ha", "hace", "hacia", "hasta", "hay", "la", "las",
    "le", "les", "lo", "los", "mas", "me", "mi", "muy", "nada", "ni", "no", "nos", "nosotros",
    "nuestro", "nuestra", "o", "otra", "otras", "otro", "otros", "para", "pero", "por", "porque",
    "que", "quien", "se", "sea", "ser", "si", "sin", "sino", "sobre", "somos", "son", "su", "sus",
    "te", "ti", "tiene", "todo", "toda", "todos", "todas", "tu", "tus", "un", "una", "uno", "unos",
    "unas", "usted", "ustedes", "ya", "yo", "dicho", "dicha", "dichos", "dichas", "mismo", "misma",
    "mismos", "mismas", "cada", "caso", "cuyo", "cuya", "cuyos", "cuyas", "han", "haber", "haya",
    "he", "hemos", "manera", "mediante", "parte", "pues", "respecto", "sera", "seran", "sido",
    "siendo", "tan", "tanto", "tres", "vez", "dos",
];

/// Spanish suffixes for light stemming. Checked in order; the first suffix
/// that leaves a stem of at least 3 characters wins.
const SUFFIXES: &[&str] = &[
    "imientos", "amiento", "imiento", "aciones", "uciones", "idades", "amente", "adores",
    "ancias", "encias", "mente", "acion", "ucion", "adora", "antes", "ibles", "istas", "idad",
    "ivas", "ivos", "ador", "ante", "anza", "able", "ible", "ista", "osa", "oso", "iva", "ivo",
    "dad", "ion", "ando", "endo", "iendo", "ados", "idos", "adas", "idas", "ado", "ido", "ada",
    "ida", "ara", "era", "ira", "aran", "eran", "iran", "aba", "ian", "es", "as", "os", "ar",
    "er", "ir",
];

fn is_stopword(token: &str) -> bool {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
        .contains(token)
}

/// Light Spanish stemmer. Must produce the same stems as the offline
/// vocabulary builder, otherwise query terms miss the index.
pub fn stem(word: &str) -> &str {
    if word.len() <= 4 {
        return word;
    }
    for suffix in SUFFIXES {
        if word.len() >= suffix.len() + 3 && word.ends_with(suffix) {
            return &word[..word.len() - suffix.len()];
        }
    }
    if word.ends_with('s') {
        return &word[..word.len() - 1];
    }
    word
}

/// Tokenize query text: lowercase, fold accents (`ñ` becomes `ny`), split on
/// non-alphanumeric runs, drop stopwords and single characters, then stem.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut folded = String::with_capacity(text.len());
    for c in text.to_lowercase().chars() {
        match c {
            'á' | 'à' => folded.push('a'),
            'é' | 'è' => folded.push('e'),
            'í' | 'ì' => folded.push('i'),
            'ó' | 'ò' => folded.push('o'),
            'ú' | 'ù' | 'ü' => folded.push('u'),
            'ñ' => folded.push_str("ny"),
            _ => folded.push(c),
        }
    }

    folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 2 && !is_stopword(t))
        .map(|t| stem(t).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stems_common_legal_terms() {
        assert_eq!(stem("vacaciones"), "vac");
        assert_eq!(stem("trabajadores"), "trabaj");
        assert_eq!(stem("cuantos"), "cuant");
        assert_eq!(stem("indemnizacion"), "indemniz");
    }

    #[test]
    fn test_short_words_pass_through() {
        assert_eq!(stem("dias"), "dias");
        assert_eq!(stem("ley"), "ley");
    }

    #[test]
    fn test_suffix_skipped_when_stem_too_short() {
        // "mente" ends with the "mente" suffix but stripping it would leave
        // nothing, so the scan continues and the word survives intact.
        assert_eq!(stem("mente"), "mente");
        // "idades" skips the full-length match and later strips "es".
        assert_eq!(stem("idades"), "idad");
    }

    #[test]
    fn test_trailing_s_fallback() {
        // No suffix matches "is", so only the final "s" comes off.
        assert_eq!(stem("crisis"), "crisi");
        assert_eq!(stem("dosis"), "dosi");
    }

    #[test]
    fn test_tokenizes_question_with_accents() {
        let tokens = tokenize("¿Cuántos días de vacaciones tengo?");
        assert_eq!(tokens, vec!["cuant", "dias", "vac", "tengo"]);
    }

    #[test]
    fn test_folds_enye_to_ny() {
        assert_eq!(tokenize("años"), vec!["any"]);
    }

    #[test]
    fn test_drops_stopwords_and_single_chars() {
        assert!(tokenize("el la de y a o").is_empty());
    }

    #[test]
    fn test_keeps_numbers() {
        assert_eq!(tokenize("30 dias"), vec!["30", "dias"]);
    }

    #[test]
    fn test_stemming_is_stable_for_query_terms() {
        for word in ["vacaciones", "trabajadores", "cuantos", "anyos", "tengo"] {
            let once = stem(word);
            assert_eq!(stem(once), once);
        }
    }
}
