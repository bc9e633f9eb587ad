//! Tokenizer loading.
//!
//! Prefers `tokenizer.json`; repositories that only ship `vocab.txt` get an
//! equivalent BERT WordPiece pipeline built in code. Either way, truncation is
//! capped at the encoder's position limit and batches are padded to their longest
//! sequence.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tokenizers::decoders::wordpiece::WordPiece as WordPieceDecoder;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::bert::BertProcessing;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

const PAD_TOKEN: &str = "[PAD]";
const UNK_TOKEN: &str = "[UNK]";
const CLS_TOKEN: &str = "[CLS]";
const SEP_TOKEN: &str = "[SEP]";

/// Load the tokenizer from a model directory and configure truncation and padding.
pub fn load_tokenizer(model_dir: &Path, max_length: usize, pad_token_id: u32) -> Result<Tokenizer> {
    let tokenizer_json = model_dir.join("tokenizer.json");
    let vocab_txt = model_dir.join("vocab.txt");

    let mut tokenizer = if tokenizer_json.is_file() {
        tracing::debug!("Loading tokenizer from {}", tokenizer_json.display());
        Tokenizer::from_file(&tokenizer_json)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?
    } else if vocab_txt.is_file() {
        let lowercase = read_do_lower_case(model_dir)?;
        tracing::debug!(
            "Building WordPiece tokenizer from {} (lowercase: {})",
            vocab_txt.display(),
            lowercase
        );
        wordpiece_from_vocab(&vocab_txt, lowercase)?
    } else {
        anyhow::bail!(
            "No tokenizer.json or vocab.txt found in {}",
            model_dir.display()
        );
    };

    configure(&mut tokenizer, max_length, pad_token_id)?;
    Ok(tokenizer)
}

/// Build a BERT WordPiece tokenizer from a `vocab.txt` file.
pub fn wordpiece_from_vocab(vocab_path: &Path, lowercase: bool) -> Result<Tokenizer> {
    let vocab_path = vocab_path
        .to_str()
        .with_context(|| format!("Non UTF-8 vocab path: {}", vocab_path.display()))?;

    let model = WordPiece::from_file(vocab_path)
        .unk_token(UNK_TOKEN.to_string())
        .build()
        .map_err(|e| anyhow!("Failed to read {}: {}", vocab_path, e))?;

    let mut tokenizer = Tokenizer::new(model);
    let cls_id = tokenizer
        .token_to_id(CLS_TOKEN)
        .with_context(|| format!("{CLS_TOKEN} missing from vocabulary"))?;
    let sep_id = tokenizer
        .token_to_id(SEP_TOKEN)
        .with_context(|| format!("{SEP_TOKEN} missing from vocabulary"))?;

    tokenizer
        .with_normalizer(Some(BertNormalizer::new(true, true, None, lowercase)))
        .with_pre_tokenizer(Some(BertPreTokenizer))
        .with_post_processor(Some(BertProcessing::new(
            (SEP_TOKEN.to_string(), sep_id),
            (CLS_TOKEN.to_string(), cls_id),
        )))
        .with_decoder(Some(WordPieceDecoder::default()));

    Ok(tokenizer)
}

/// `do_lower_case` from `tokenizer_config.json`, defaulting to uncased.
fn read_do_lower_case(model_dir: &Path) -> Result<bool> {
    let path = model_dir.join("tokenizer_config.json");
    if !path.is_file() {
        return Ok(true);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let data: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(data
        .get("do_lower_case")
        .and_then(|v| v.as_bool())
        .unwrap_or(true))
}

fn configure(tokenizer: &mut Tokenizer, max_length: usize, pad_token_id: u32) -> Result<()> {
    let (pad_id, pad_token) = match tokenizer.token_to_id(PAD_TOKEN) {
        Some(id) => (id, PAD_TOKEN.to_string()),
        None => {
            let token = tokenizer
                .id_to_token(pad_token_id)
                .with_context(|| format!("Pad token id {pad_token_id} is not in the vocabulary"))?;
            (pad_token_id, token)
        }
    };

    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        pad_id,
        pad_token,
        ..Default::default()
    }));

    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| anyhow!("Failed to configure truncation: {}", e))?;

    Ok(())
}
