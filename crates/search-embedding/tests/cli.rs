use std::sync::Mutex;

use serde_json::{Value, json};
use specter_embeddings::{Embedder, Embedding};

/// Records every batch it sees and returns `[0.5, -0.5]` per text.
#[derive(Default)]
struct RecordingEmbedder {
    batches: Mutex<Vec<Vec<String>>>,
}

impl Embedder for RecordingEmbedder {
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Embedding>> {
        self.batches.lock().unwrap().push(texts.to_vec());
        Ok(texts.iter().map(|_| vec![0.5, -0.5]).collect())
    }

    fn dimension(&self) -> usize {
        2
    }
}

fn run(input: &str, embedder: &RecordingEmbedder) -> anyhow::Result<String> {
    let mut output = Vec::new();
    search_embedding::run(input.as_bytes(), &mut output, embedder)?;
    Ok(String::from_utf8(output).unwrap())
}

#[test]
fn test_prints_embedding_without_dim() {
    let embedder = RecordingEmbedder::default();
    let output = run(r#"{"query": "  citation graphs "}"#, &embedder).unwrap();

    assert!(output.ends_with('\n'));
    assert_eq!(output.lines().count(), 1);
    let body: Value = serde_json::from_str(&output).unwrap();
    assert_eq!(body, json!({"embedding": [0.5, -0.5]}));
    assert_eq!(output, "{\"embedding\": [0.5, -0.5]}\n");
    assert!(body.get("dim").is_none());

    let batches = embedder.batches.lock().unwrap();
    assert_eq!(*batches, vec![vec!["citation graphs".to_string()]]);
}

#[test]
fn test_blank_query_prints_error() {
    for input in [r#"{"query": ""}"#, r#"{"query": " \n\t "}"#, "{}"] {
        let embedder = RecordingEmbedder::default();
        let output = run(input, &embedder).unwrap();

        assert_eq!(output, "{\"error\": \"empty query\"}\n");
        assert!(
            embedder.batches.lock().unwrap().is_empty(),
            "Blank queries must not reach the model"
        );
    }
}

#[test]
fn test_malformed_input_is_an_error() {
    let embedder = RecordingEmbedder::default();
    let mut output = Vec::new();

    let result = search_embedding::run("not json".as_bytes(), &mut output, &embedder);
    assert!(result.is_err());
    assert!(output.is_empty(), "Nothing should be printed on failure");
}

#[test]
fn test_model_failure_is_an_error() {
    struct Failing;

    impl Embedder for Failing {
        fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Embedding>> {
            anyhow::bail!("out of memory")
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    let mut output = Vec::new();
    let result = search_embedding::run(r#"{"query": "x"}"#.as_bytes(), &mut output, &Failing);
    assert!(result.is_err());
    assert!(output.is_empty());
}
