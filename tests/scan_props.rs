//! Property tests for the scanner: every token spans a contiguous slice of
//! the source, so gluing lexemes back together reproduces it.

use gravlax::{Scanner, Token};
use proptest::prelude::*;

fn scan_all(src: &str) -> Vec<Token> {
    Scanner::new(src)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("generated source contains no scan errors")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn words_scan_to_single_tokens(word in "[a-z_][a-zA-Z0-9_]{0,12}") {
        let tokens = scan_all(&word);
        prop_assert_eq!(tokens.len(), 1);
        prop_assert_eq!(&tokens[0].lexeme, &word);
    }

    #[test]
    fn integers_scan_to_single_tokens(n in any::<u32>()) {
        let src = n.to_string();
        let tokens = scan_all(&src);
        prop_assert_eq!(tokens.len(), 1);
        prop_assert_eq!(&tokens[0].lexeme, &src);
    }

    #[test]
    fn fractional_numbers_scan_to_single_tokens(whole in any::<u32>(), frac in 0u32..=999_999) {
        let src = format!("{}.{}", whole, frac);
        let tokens = scan_all(&src);
        prop_assert_eq!(tokens.len(), 1);
        prop_assert_eq!(&tokens[0].lexeme, &src);
    }

    #[test]
    fn string_literals_keep_their_quotes(contents in "[a-zA-Z0-9 .,+-]{0,24}") {
        let src = format!("\"{}\"", contents);
        let tokens = scan_all(&src);
        prop_assert_eq!(tokens.len(), 1);
        prop_assert_eq!(&tokens[0].lexeme, &src);
    }

    #[test]
    fn lexemes_tile_the_source(words in prop::collection::vec("[a-z][a-z0-9]{0,6}|[0-9]{1,4}", 1..20)) {
        let src = words.join(" ");
        let tokens = scan_all(&src);
        let lexemes: Vec<String> = tokens.iter().map(|t| t.lexeme.clone()).collect();
        prop_assert_eq!(lexemes, words);
    }

    #[test]
    fn line_numbers_are_monotone(lines in prop::collection::vec("[a-z]{1,6}", 1..10)) {
        let src = lines.join("\n");
        let tokens = scan_all(&src);
        for (idx, token) in tokens.iter().enumerate() {
            prop_assert_eq!(token.pos.line, idx + 1);
        }
    }
}
