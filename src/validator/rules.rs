//! Pattern tables for the static and domain stages.

use std::sync::LazyLock;

use regex::Regex;

/// A deny-list entry. A match is ignored when the text right after it starts
/// with `exempt_prefix`.
pub struct DenyRule {
    pub pattern: Regex,
    pub message: &'static str,
    pub exempt_prefix: Option<&'static str>,
}

impl DenyRule {
    fn new(pattern: &str, message: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("deny rule pattern"),
            message,
            exempt_prefix: None,
        }
    }

    fn exempt(mut self, prefix: &'static str) -> Self {
        self.exempt_prefix = Some(prefix);
        self
    }

    pub fn violated_by(&self, code: &str) -> bool {
        self.pattern.find_iter(code).any(|m| match self.exempt_prefix {
            Some(prefix) => !code[m.end()..].starts_with(prefix),
            None => true,
        })
    }
}

pub static DENY_RULES: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    vec![
        DenyRule::new(
            r"\bos\.system\s*\(",
            "Direct system commands are not allowed (os.system)",
        ),
        DenyRule::new(
            r"\bos\.(popen|exec\w*|spawn\w*|fork\w*)\s*\(",
            "Process creation through the os module is not allowed",
        ),
        DenyRule::new(
            r"\bsubprocess\.\w+\s*\(",
            "Subprocess calls are not allowed",
        ),
        DenyRule::new(
            r#"\bopen\s*\(\s*["']\s*/"#,
            "File operations outside of /tmp directory are not allowed",
        )
        .exempt("tmp"),
        DenyRule::new(
            r"(?m)^\s*(import\s+socket\b|from\s+socket\s+import\b)",
            "Network operations are not allowed",
        ),
        DenyRule::new(r"\bshutil\.rmtree\b", "Recursive directory removal is not allowed"),
        DenyRule::new(
            r"\brange\s*\(\s*\d{7,}\s*\)",
            "Potentially excessive loop detected",
        ),
    ]
});

pub static WHILE_TRUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bwhile\s+True\b").expect("while pattern"));

pub static BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bbreak\b").expect("break pattern"));

pub static MANIM_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(from\s+manim\s+import\b|import\s+manim\b)").expect("import pattern")
});

pub static SCENE_SUBCLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bclass\s+\w+\s*\([^)]*\bScene\b[^)]*\)").expect("scene pattern")
});

pub static CONSTRUCT_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bdef\s+construct\s*\(\s*self\s*\)").expect("construct pattern")
});

pub static DRAWABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(Circle|Square|Rectangle|Triangle|Polygon|Dot|Line|Arrow|Text|MathTex|Tex|VGroup|Group|Graph|Axes|NumberPlane)\s*\(",
    )
    .expect("drawable pattern")
});

pub static SCENE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bself\.(play|wait|add|remove)\s*\(").expect("scene call pattern")
});

#[cfg(test)]
mod tests {
    use super::*;

    fn violations(code: &str) -> Vec<&'static str> {
        DENY_RULES
            .iter()
            .filter(|r| r.violated_by(code))
            .map(|r| r.message)
            .collect()
    }

    #[test]
    fn test_open_under_tmp_is_exempt() {
        assert!(violations("open('/tmp/x.txt', 'w')").is_empty());
        assert_eq!(
            violations("open(\"/etc/passwd\")"),
            vec!["File operations outside of /tmp directory are not allowed"]
        );
        // One exempt match does not hide a later violation.
        assert_eq!(violations("open('/tmp/a'); open('/home/b')").len(), 1);
        assert!(violations("open('relative.txt')").is_empty());
    }

    #[test]
    fn test_process_spawning_is_denied() {
        assert_eq!(violations("os.system('ls')").len(), 1);
        assert_eq!(violations("os.popen('ls')").len(), 1);
        assert_eq!(violations("os.execvp('ls', [])").len(), 1);
        assert_eq!(violations("subprocess.run(['ls'])").len(), 1);
        assert_eq!(violations("subprocess.check_call(['ls'])").len(), 1);
    }

    #[test]
    fn test_socket_and_rmtree_and_big_range() {
        assert_eq!(violations("import socket\n").len(), 1);
        assert_eq!(violations("from socket import create_connection\n").len(), 1);
        assert_eq!(violations("shutil.rmtree('/tmp/x')").len(), 1);
        assert_eq!(violations("for i in range(1000000):\n    pass").len(), 1);
        assert!(violations("for i in range(999999):\n    pass").is_empty());
    }

    #[test]
    fn test_benign_code_passes() {
        let code = "from manim import *\nclass A(Scene):\n    def construct(self):\n        self.play(Create(Circle()))\n";
        assert!(violations(code).is_empty());
    }
}
