//! In-memory keyword retriever over a JSON file of portfolio documents.
//!
//! Stand-in for the external vector store: scores each document by how many
//! query terms it shares, with title matches counting double.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::{ContextChunk, ResponderError, Retriever};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "you", "your", "what", "did", "does", "are", "was", "were", "how",
    "tell", "about", "with", "this", "that", "have", "has", "can", "his", "her", "their", "me",
    "more", "any", "who", "why", "when", "where", "which",
];

/// A portfolio document as stored on disk
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

struct Indexed {
    document: Document,
    title_terms: HashSet<String>,
    body_terms: HashSet<String>,
}

pub struct CorpusRetriever {
    documents: Vec<Indexed>,
}

impl CorpusRetriever {
    pub fn from_documents(documents: Vec<Document>) -> Self {
        let documents = documents
            .into_iter()
            .map(|document| {
                let title_terms = terms(&document.title);
                let mut body_terms = terms(&document.content);
                for tag in &document.tags {
                    body_terms.extend(terms(tag));
                }
                Indexed {
                    document,
                    title_terms,
                    body_terms,
                }
            })
            .collect();
        Self { documents }
    }

    pub fn from_path(path: &Path) -> Result<Self, ResponderError> {
        let raw = std::fs::read_to_string(path)?;
        let documents: Vec<Document> = serde_json::from_str(&raw)?;
        info!(
            component = "corpus",
            event = "corpus.loaded",
            path = %path.display(),
            documents = documents.len(),
            "Loaded portfolio corpus"
        );
        Ok(Self::from_documents(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl Retriever for CorpusRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ContextChunk>, ResponderError> {
        let query_terms = terms(query);
        if query_terms.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let mut scored: Vec<ContextChunk> = self
            .documents
            .iter()
            .filter_map(|indexed| {
                let hits: f32 = query_terms
                    .iter()
                    .map(|term| {
                        if indexed.title_terms.contains(term) {
                            2.0
                        } else if indexed.body_terms.contains(term) {
                            1.0
                        } else {
                            0.0
                        }
                    })
                    .sum();
                (hits > 0.0).then(|| ContextChunk {
                    title: indexed.document.title.clone(),
                    content: indexed.document.content.clone(),
                    score: hits / query_terms.len() as f32,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn corpus() -> CorpusRetriever {
        CorpusRetriever::from_documents(vec![
            Document {
                title: "Atlas search".to_string(),
                content: "Built a distributed search engine in Rust at Lumen.".to_string(),
                tags: vec!["work".to_string()],
            },
            Document {
                title: "Noir quotes".to_string(),
                content: "A collection of hardboiled detective quotes.".to_string(),
                tags: vec![],
            },
            Document {
                title: "Lumen".to_string(),
                content: "Last job: staff engineer leading the search team.".to_string(),
                tags: vec!["job".to_string()],
            },
        ])
    }

    #[tokio::test]
    async fn ranks_title_hits_above_body_hits() {
        let results = corpus().retrieve("Lumen job", 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Lumen");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn respects_k_and_ignores_stopwords() {
        let results = corpus().retrieve("what did you build with rust", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Atlas search");

        assert!(corpus().retrieve("what about the", 5).await.unwrap().is_empty());
    }

    #[test]
    fn loads_documents_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"[{{"title":"A","content":"alpha project"}},{{"title":"B","content":"beta","tags":["x"]}}]"#
        )
        .expect("write");

        let retriever = CorpusRetriever::from_path(file.path()).expect("load");
        assert_eq!(retriever.len(), 2);
    }

    #[tokio::test]
    async fn demo_portfolio_answers_a_job_question() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/portfolio.json");
        let retriever = CorpusRetriever::from_path(&path).expect("load demo corpus");
        assert_eq!(retriever.len(), 4);

        let results = retriever.retrieve("kafka dashboard", 2).await.unwrap();
        assert_eq!(results[0].title, "Lumen: realtime analytics dashboard");
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = CorpusRetriever::from_path(Path::new("/definitely/not/here.json"));
        assert!(matches!(result, Err(ResponderError::Io(_))));
    }
}
