use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::TokenizerConfig;
use crate::error::{MiningError, Result};

/// Coarse part-of-speech classes the filter reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartOfSpeech {
    Noun,
    ProperNoun,
    Pronoun,
    Numeral,
    Verb,
    Adjective,
    Adverb,
    Particle,
    Auxiliary,
    Conjunction,
    Interjection,
    Prefix,
    Suffix,
    Symbol,
    Other,
}

impl PartOfSpeech {
    /// Map MeCab feature columns (IPADIC or UniDic labels) to a class
    pub fn from_mecab(major: &str, minor: &str) -> Self {
        match major {
            "名詞" => match minor {
                "代名詞" => PartOfSpeech::Pronoun,
                "数" | "数詞" => PartOfSpeech::Numeral,
                "固有名詞" => PartOfSpeech::ProperNoun,
                "接尾" => PartOfSpeech::Suffix,
                "形容動詞語幹" => PartOfSpeech::Adjective,
                _ => PartOfSpeech::Noun,
            },
            "代名詞" => PartOfSpeech::Pronoun,
            "動詞" => PartOfSpeech::Verb,
            "形容詞" | "形状詞" | "連体詞" => PartOfSpeech::Adjective,
            "副詞" => PartOfSpeech::Adverb,
            "助詞" => PartOfSpeech::Particle,
            "助動詞" => PartOfSpeech::Auxiliary,
            "接続詞" => PartOfSpeech::Conjunction,
            "感動詞" | "フィラー" => PartOfSpeech::Interjection,
            "接頭詞" | "接頭辞" => PartOfSpeech::Prefix,
            "接尾辞" => PartOfSpeech::Suffix,
            "記号" | "補助記号" | "空白" => PartOfSpeech::Symbol,
            _ => PartOfSpeech::Other,
        }
    }
}

/// A morphological token from a cue's text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub surface: String,
    pub base_form: String,
    pub part_of_speech: PartOfSpeech,
}

impl Token {
    pub fn new(surface: impl Into<String>, base_form: impl Into<String>, part_of_speech: PartOfSpeech) -> Self {
        Self {
            surface: surface.into(),
            base_form: base_form.into(),
            part_of_speech,
        }
    }
}

/// Morphological analysis capability
#[async_trait]
pub trait Tokenizer: Send + Sync {
    async fn tokenize(&self, text: &str) -> Result<Vec<Token>>;

    /// Tokenize several lines, one result per input line
    async fn tokenize_lines(&self, lines: &[String]) -> Result<Vec<Vec<Token>>> {
        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            out.push(self.tokenize(line).await?);
        }
        Ok(out)
    }
}

/// Tokenizer backed by the `mecab` command line tool
pub struct MecabTokenizer {
    config: TokenizerConfig,
}

impl MecabTokenizer {
    pub fn new(config: TokenizerConfig) -> Self {
        Self { config }
    }

    async fn run(&self, input: String) -> Result<String> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MiningError::Tokenizer(format!("cannot start {}: {}", self.config.command, e)))?;

        // Feed stdin from its own task so a large episode cannot fill both pipes
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let result = stdin.write_all(input.as_bytes()).await;
                drop(stdin);
                result
            })
        });

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(MiningError::Tokenizer(format!(
                "{} exited with {}: {}",
                self.config.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| MiningError::Tokenizer(format!("stdin writer failed: {}", e)))??;
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Tokenizer for MecabTokenizer {
    async fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        let line = text.replace(['\n', '\r'], " ");
        if line.trim().is_empty() {
            return Ok(Vec::new());
        }
        let output = self.run(format!("{}\n", line)).await?;
        let mut sentences = parse_mecab_output(&output, self.config.lemma_field);
        Ok(sentences.pop().unwrap_or_default())
    }

    async fn tokenize_lines(&self, lines: &[String]) -> Result<Vec<Vec<Token>>> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        // One process for the whole episode; mecab emits EOS per input line
        let input: String = lines
            .iter()
            .map(|l| format!("{}\n", l.replace(['\n', '\r'], " ")))
            .collect();
        let output = self.run(input).await?;
        let sentences = parse_mecab_output(&output, self.config.lemma_field);

        if sentences.len() != lines.len() {
            return Err(MiningError::Tokenizer(format!(
                "expected {} sentences from mecab, got {}",
                lines.len(),
                sentences.len()
            )));
        }
        debug!("Tokenized {} lines in one mecab call", lines.len());
        Ok(sentences)
    }
}

/// Parse `surface\tfeature,feature,...` rows into one token list per EOS
pub fn parse_mecab_output(output: &str, lemma_field: usize) -> Vec<Vec<Token>> {
    let mut sentences = Vec::new();
    let mut current = Vec::new();

    for row in output.lines() {
        if row == "EOS" {
            sentences.push(std::mem::take(&mut current));
            continue;
        }
        let Some((surface, features)) = row.split_once('\t') else {
            continue;
        };
        if surface.is_empty() {
            continue;
        }

        let features: Vec<&str> = features.split(',').collect();
        let major = features.first().copied().unwrap_or("");
        let minor = features.get(1).copied().unwrap_or("");
        let base_form = match features.get(lemma_field) {
            Some(lemma) if !lemma.is_empty() && *lemma != "*" => lemma.to_string(),
            _ => surface.to_string(),
        };

        current.push(Token::new(surface, base_form, PartOfSpeech::from_mecab(major, minor)));
    }

    if !current.is_empty() {
        sentences.push(current);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPADIC: &str = "猫\t名詞,一般,*,*,*,*,猫,ネコ,ネコ\nが\t助詞,格助詞,一般,*,*,*,が,ガ,ガ\n好き\t名詞,形容動詞語幹,*,*,*,*,好き,スキ,スキ\nです\t助動詞,*,*,*,特殊・デス,基本形,です,デス,デス\nEOS\n走っ\t動詞,自立,*,*,五段・ラ行,連用タ接続,走る,ハシッ,ハシッ\nた\t助動詞,*,*,*,特殊・タ,基本形,た,タ,タ\nEOS\n";

    #[test]
    fn test_parse_ipadic_output() {
        let sentences = parse_mecab_output(IPADIC, 6);
        assert_eq!(sentences.len(), 2);

        let first = &sentences[0];
        assert_eq!(first.len(), 4);
        assert_eq!(first[0], Token::new("猫", "猫", PartOfSpeech::Noun));
        assert_eq!(first[1].part_of_speech, PartOfSpeech::Particle);
        assert_eq!(first[2].part_of_speech, PartOfSpeech::Adjective);
        assert_eq!(first[3].part_of_speech, PartOfSpeech::Auxiliary);

        assert_eq!(sentences[1][0].surface, "走っ");
        assert_eq!(sentences[1][0].base_form, "走る");
    }

    #[test]
    fn test_unknown_lemma_falls_back_to_surface() {
        let sentences = parse_mecab_output("ドキドキ\t副詞,*,*,*\nEOS\n", 6);
        assert_eq!(sentences[0][0].base_form, "ドキドキ");
        assert_eq!(sentences[0][0].part_of_speech, PartOfSpeech::Adverb);
    }

    #[test]
    fn test_unidic_labels() {
        assert_eq!(PartOfSpeech::from_mecab("形状詞", "一般"), PartOfSpeech::Adjective);
        assert_eq!(PartOfSpeech::from_mecab("代名詞", ""), PartOfSpeech::Pronoun);
        assert_eq!(PartOfSpeech::from_mecab("補助記号", "句点"), PartOfSpeech::Symbol);
        assert_eq!(PartOfSpeech::from_mecab("名詞", "数詞"), PartOfSpeech::Numeral);
    }

    #[tokio::test]
    async fn test_missing_mecab_binary_is_tokenizer_error() {
        let tokenizer = MecabTokenizer::new(TokenizerConfig {
            command: "definitely-not-a-real-mecab-binary".to_string(),
            ..TokenizerConfig::default()
        });
        let err = tokenizer.tokenize("猫").await.unwrap_err();
        assert!(matches!(err, MiningError::Tokenizer(_)));
    }
}
