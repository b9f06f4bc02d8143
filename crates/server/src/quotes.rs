//! Conversation-starter quotes shown while the chat is idle.

use rand::seq::SliceRandom;

#[derive(Debug, Clone, Default)]
pub struct QuoteBook {
    quotes: Vec<String>,
}

impl QuoteBook {
    pub fn new(quotes: &[String]) -> Self {
        Self {
            quotes: quotes
                .iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect(),
        }
    }

    pub fn pick(&self) -> Option<String> {
        self.quotes.choose(&mut rand::thread_rng()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_from_configured_quotes() {
        let book = QuoteBook::new(&["  one ".to_string(), "two".to_string(), " ".to_string()]);
        for _ in 0..20 {
            let quote = book.pick().unwrap();
            assert!(quote == "one" || quote == "two");
        }
    }

    #[test]
    fn empty_book_picks_nothing() {
        assert_eq!(QuoteBook::default().pick(), None);
    }
}
