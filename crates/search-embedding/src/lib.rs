//! One-shot query embedding over stdin/stdout.
//!
//! Reads `{"query": "..."}` and writes a single JSON line: `{"embedding": [...]}`,
//! or `{"error": "empty query"}` for blank input. Separators are `", "` and
//! `": "`, the same spacing Python's `json.dumps` produces.

use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use specter_embeddings::{Embedder, Embedding, Query};

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SearchResponse {
    Embedding { embedding: Embedding },
    Error { error: String },
}

/// Read one request from `input`, embed it, and write the response line to `output`.
pub fn run(mut input: impl Read, mut output: impl Write, embedder: &dyn Embedder) -> Result<()> {
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .context("Failed to read stdin")?;
    let request: SearchRequest = serde_json::from_str(&raw).context("Invalid request JSON")?;

    let response = respond(&request, embedder)?;

    let mut serializer = serde_json::Serializer::with_formatter(&mut output, SpacedFormatter);
    response.serialize(&mut serializer)?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn respond(request: &SearchRequest, embedder: &dyn Embedder) -> Result<SearchResponse> {
    let query = match Query::parse(&request.query) {
        Ok(query) => query,
        Err(e) => {
            return Ok(SearchResponse::Error {
                error: e.to_string(),
            });
        }
    };

    let embedding = embedder
        .embed(&[query.into_string()])?
        .into_iter()
        .next()
        .context("Embedder returned no vector")?;
    tracing::debug!("Computed {}-dimensional embedding", embedding.len());

    Ok(SearchResponse::Embedding { embedding })
}

/// Compact JSON with a space after every `,` and `:`.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}
