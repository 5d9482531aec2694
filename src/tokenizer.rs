//! 源代码分词器
//!
//! 面向 C 系语言代码片段的简单词法切分：去掉注释，按空白切分，
//! 并把 `{ } ( ) ; , .` 拆成独立 token。双引号只作分隔符，不产生 token。

use std::sync::LazyLock;

use regex::Regex;

/// `/* ... */`，可跨行
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("Invalid block comment regex"));

/// `// ...` 到行尾
static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//[^\n]*").expect("Invalid line comment regex"));

/// 单字符标点，或不含空白/标点/引号的最长串
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[{}();,.]|[^\s{}();,."]+"#).expect("Invalid token regex"));

/// 代码分词器
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeTokenizer;

impl CodeTokenizer {
    pub fn new() -> Self {
        Self
    }

    /// 去掉块注释和行注释
    pub fn strip_comments(&self, code: &str) -> String {
        let without_blocks = BLOCK_COMMENT.replace_all(code, " ");
        LINE_COMMENT.replace_all(&without_blocks, "").into_owned()
    }

    /// 分词（保留大小写）
    ///
    /// ```text
    /// "if (x) { y(); } // done"  →  [if, (, x, ), {, y, (, ), ;, }]
    /// ```
    pub fn tokenize(&self, code: &str) -> Vec<String> {
        let stripped = self.strip_comments(code);
        TOKEN
            .find_iter(&stripped)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(code: &str) -> Vec<String> {
        CodeTokenizer::new().tokenize(code)
    }

    #[test]
    fn test_punctuation_is_split() {
        assert_eq!(
            tokens("System.out.println(x);"),
            vec!["System", ".", "out", ".", "println", "(", "x", ")", ";"]
        );
    }

    #[test]
    fn test_comments_removed() {
        let code = "int a = 1; // trailing\n/* block\n spanning */ return a;";
        assert_eq!(
            tokens(code),
            vec!["int", "a", "=", "1", ";", "return", "a", ";"]
        );
    }

    #[test]
    fn test_quotes_are_separators() {
        assert_eq!(
            tokens(r#"query("SELECT *", id)"#),
            vec!["query", "(", "SELECT", "*", ",", "id", ")"]
        );
    }

    #[test]
    fn test_operators_kept_and_case_preserved() {
        assert_eq!(
            tokens("while ((data = fis.Read()) != -1) {}"),
            vec![
                "while", "(", "(", "data", "=", "fis", ".", "Read", "(", ")", ")", "!=", "-1",
                ")", "{", "}"
            ]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(tokens("   \n\t// only a comment").is_empty());
    }
}
