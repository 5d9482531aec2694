//! 数据集和数据处理
//!
//! 标注语料的解析、词汇表构建，以及定长 token 序列 + 注意力掩码的编码。
//!
//! 语料格式为若干个 `<代码>|||LABEL|||<整数>` 片段首尾相接。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::UNK_ID;
use crate::error::{ModelError, Result};

pub const PAD_ID: usize = 0;
pub const SOS_ID: usize = 2;
pub const EOS_ID: usize = 3;

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const SOS_TOKEN: &str = "[SOS]";
pub const EOS_TOKEN: &str = "[EOS]";

const SPECIAL_TOKENS: [&str; 4] = [PAD_TOKEN, UNK_TOKEN, SOS_TOKEN, EOS_TOKEN];

static LABELED_SNIPPET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(.+?)\|\|\|LABEL\|\|\|(\d+)").expect("Invalid labeled snippet regex")
});

/// 带标签的代码片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSnippet {
    pub code: String,
    pub label: usize,
}

/// 解析标注语料
///
/// 代码部分去掉首尾空白；无法解析的标签或空代码片段跳过并记录警告。
/// 一个片段都没有解析出来时返回 `Dataset` 错误。
pub fn parse_labeled_corpus(text: &str) -> Result<Vec<LabeledSnippet>> {
    let mut snippets = Vec::new();

    for caps in LABELED_SNIPPET.captures_iter(text) {
        let code = caps[1].trim();
        let label = match caps[2].parse::<usize>() {
            Ok(label) => label,
            Err(e) => {
                warn!(label = &caps[2], error = %e, "skipping snippet with unparsable label");
                continue;
            }
        };
        if code.is_empty() {
            warn!(label, "skipping empty snippet");
            continue;
        }
        snippets.push(LabeledSnippet {
            code: code.to_string(),
            label,
        });
    }

    if snippets.is_empty() {
        return Err(ModelError::Dataset(
            "no `<code>|||LABEL|||<n>` entries found".to_string(),
        ));
    }
    debug!(snippets = snippets.len(), "parsed labeled corpus");
    Ok(snippets)
}

/// 从文件读取并解析标注语料
pub fn load_labeled_corpus<P: AsRef<Path>>(path: P) -> Result<Vec<LabeledSnippet>> {
    let text = fs::read_to_string(path.as_ref())?;
    parse_labeled_corpus(&text)
}

/// 定长编码后的序列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSequence {
    pub token_ids: Vec<usize>,
    /// 1 = 真实 token，0 = PAD
    pub attention_mask: Vec<u8>,
}

impl EncodedSequence {
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// 掩码为 1 的位置数（包含 SOS/EOS）
    pub fn real_length(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }
}

/// 训练样本：编码后的序列 + 类别标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExample {
    pub sequence: EncodedSequence,
    pub label: usize,
}

/// 词汇表
///
/// 保留 ID：0 `[PAD]`，1 `[UNK]`，2 `[SOS]`，3 `[EOS]`；
/// 其余 token 按语料中首次出现的顺序从 4 开始连续编号。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "VocabularyFile", into = "VocabularyFile")]
pub struct Vocabulary {
    /// token 到 ID 的映射
    token_to_id: HashMap<String, usize>,
    /// ID 到 token 的映射
    id_to_token: Vec<String>,
    /// 编码后的定长序列长度
    max_len: usize,
}

/// 词汇表的持久化形式
#[derive(Serialize, Deserialize)]
struct VocabularyFile {
    max_len: usize,
    tokens: Vec<String>,
}

impl From<Vocabulary> for VocabularyFile {
    fn from(vocab: Vocabulary) -> Self {
        Self {
            max_len: vocab.max_len,
            tokens: vocab.id_to_token,
        }
    }
}

impl TryFrom<VocabularyFile> for Vocabulary {
    type Error = ModelError;

    fn try_from(file: VocabularyFile) -> Result<Self> {
        check_max_len(file.max_len)?;
        if file.tokens.len() < SPECIAL_TOKENS.len()
            || file.tokens[..SPECIAL_TOKENS.len()] != SPECIAL_TOKENS
        {
            return Err(ModelError::Dataset(
                "vocabulary must start with [PAD], [UNK], [SOS], [EOS]".to_string(),
            ));
        }

        let mut token_to_id = HashMap::with_capacity(file.tokens.len());
        for (id, token) in file.tokens.iter().enumerate() {
            if token_to_id.insert(token.clone(), id).is_some() {
                return Err(ModelError::Dataset(format!(
                    "duplicate vocabulary token {:?}",
                    token
                )));
            }
        }

        Ok(Self {
            token_to_id,
            id_to_token: file.tokens,
            max_len: file.max_len,
        })
    }
}

fn check_max_len(max_len: usize) -> Result<()> {
    if max_len < 2 {
        return Err(ModelError::InvalidConfig(format!(
            "max_len must leave room for [SOS] and [EOS], got {}",
            max_len
        )));
    }
    Ok(())
}

impl Vocabulary {
    /// 只包含保留 token 的词汇表
    pub fn new(max_len: usize) -> Result<Self> {
        check_max_len(max_len)?;

        let mut vocab = Self {
            token_to_id: HashMap::new(),
            id_to_token: Vec::new(),
            max_len,
        };
        for token in SPECIAL_TOKENS {
            vocab.add_token(token);
        }
        Ok(vocab)
    }

    /// 从分好词的语料构建词汇表
    pub fn build<S: AsRef<str>>(sequences: &[Vec<S>], max_len: usize) -> Result<Self> {
        let mut vocab = Self::new(max_len)?;
        for sequence in sequences {
            for token in sequence {
                vocab.add_token(token.as_ref());
            }
        }
        debug!(vocab_size = vocab.len(), max_len, "built vocabulary");
        Ok(vocab)
    }

    /// 添加 token（已存在时返回原 ID）
    pub fn add_token(&mut self, token: &str) -> usize {
        if let Some(&id) = self.token_to_id.get(token) {
            return id;
        }
        let id = self.id_to_token.len();
        self.token_to_id.insert(token.to_string(), id);
        self.id_to_token.push(token.to_string());
        id
    }

    /// token 对应的 ID，未知 token 为 `[UNK]`
    pub fn id(&self, token: &str) -> usize {
        self.token_to_id.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.id_to_token.get(id).map(String::as_str)
    }

    /// 获取词汇表大小
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    /// 永远包含保留 token，因此不会为空
    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// 编码为定长序列
    ///
    /// ```text
    /// [SOS] t₁ … tₖ [EOS] [PAD] …      k = min(len, max_len - 2)
    ///   1   1 …  1   1     0   …      (attention mask)
    /// ```
    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> EncodedSequence {
        let mut token_ids = vec![PAD_ID; self.max_len];
        let mut attention_mask = vec![0u8; self.max_len];

        let kept = tokens.len().min(self.max_len - 2);
        token_ids[0] = SOS_ID;
        for (i, token) in tokens.iter().take(kept).enumerate() {
            token_ids[i + 1] = self.id(token.as_ref());
        }
        token_ids[kept + 1] = EOS_ID;
        attention_mask[..kept + 2].fill(1);

        EncodedSequence {
            token_ids,
            attention_mask,
        }
    }

    /// 将 token IDs 转换回文本（跳过 PAD）
    pub fn decode(&self, token_ids: &[usize]) -> String {
        token_ids
            .iter()
            .filter(|&&id| id != PAD_ID)
            .map(|&id| self.token(id).unwrap_or(UNK_TOKEN))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// 保存为 JSON
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 从 JSON 加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labeled_corpus() {
        let text = "// safe\nclass A {}\n|||LABEL|||0\n\n  int x = 1; |||LABEL|||3";
        let snippets = parse_labeled_corpus(text).unwrap();

        assert_eq!(snippets.len(), 2);
        assert_eq!(snippets[0].code, "// safe\nclass A {}");
        assert_eq!(snippets[0].label, 0);
        assert_eq!(snippets[1].code, "int x = 1;");
        assert_eq!(snippets[1].label, 3);
    }

    #[test]
    fn test_parse_skips_overflowing_label() {
        let text = "a();|||LABEL|||99999999999999999999999 b();|||LABEL|||1";
        let snippets = parse_labeled_corpus(text).unwrap();
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].code, "b();");
    }

    #[test]
    fn test_parse_empty_corpus() {
        assert!(matches!(
            parse_labeled_corpus("no labels here"),
            Err(ModelError::Dataset(_))
        ));
    }

    #[test]
    fn test_vocabulary_ids_in_first_seen_order() {
        let vocab = Vocabulary::build(&[vec!["int", "x", "int"], vec!["y", "x"]], 10).unwrap();

        assert_eq!(vocab.len(), 7);
        assert_eq!(vocab.id("[PAD]"), 0);
        assert_eq!(vocab.id("int"), 4);
        assert_eq!(vocab.id("x"), 5);
        assert_eq!(vocab.id("y"), 6);
        assert_eq!(vocab.id("never"), UNK_ID);
        assert_eq!(vocab.token(5), Some("x"));
        assert_eq!(vocab.token(7), None);
    }

    #[test]
    fn test_encode_layout() {
        let vocab = Vocabulary::build(&[vec!["a", "b"]], 6).unwrap();
        let encoded = vocab.encode(&["a", "zzz", "b"]);

        assert_eq!(encoded.token_ids, vec![SOS_ID, 4, UNK_ID, 5, EOS_ID, PAD_ID]);
        assert_eq!(encoded.attention_mask, vec![1, 1, 1, 1, 1, 0]);
        assert_eq!(encoded.real_length(), 5);
    }

    #[test]
    fn test_encode_truncates() {
        let vocab = Vocabulary::build(&[vec!["a"]], 4).unwrap();
        let encoded = vocab.encode(&["a", "a", "a", "a"]);

        assert_eq!(encoded.token_ids, vec![SOS_ID, 4, 4, EOS_ID]);
        assert_eq!(encoded.attention_mask, vec![1, 1, 1, 1]);

        let empty = vocab.encode::<&str>(&[]);
        assert_eq!(empty.token_ids, vec![SOS_ID, EOS_ID, PAD_ID, PAD_ID]);
        assert_eq!(empty.attention_mask, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_max_len_too_small() {
        assert!(matches!(
            Vocabulary::new(1),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_decode() {
        let vocab = Vocabulary::build(&[vec!["x", "+"]], 6).unwrap();
        let encoded = vocab.encode(&["x", "+", "x"]);
        assert_eq!(vocab.decode(&encoded.token_ids), "[SOS] x + x [EOS]");
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocabulary.json");

        let vocab = Vocabulary::build(&[vec!["fn", "main", "(", ")"]], 12).unwrap();
        vocab.save_json(&path).unwrap();
        let loaded = Vocabulary::load_json(&path).unwrap();

        assert_eq!(loaded.len(), vocab.len());
        assert_eq!(loaded.max_len(), 12);
        assert_eq!(loaded.id("main"), vocab.id("main"));
        assert_eq!(loaded.encode(&["main", "("]), vocab.encode(&["main", "("]));
    }

    #[test]
    fn test_rejects_malformed_file() {
        let json = r#"{"max_len": 8, "tokens": ["a", "b"]}"#;
        assert!(serde_json::from_str::<Vocabulary>(json).is_err());
    }
}
