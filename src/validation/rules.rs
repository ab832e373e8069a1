//! Built-in deny rules.
//!
//! Patterns cover the guest languages the backends run (JavaScript and WAT)
//! plus the spellings models commonly reach for in other languages when they
//! ignore the prompt. They are lexical and easy to evade; the sandbox is the
//! boundary, these only catch the obvious cases early.

use serde::{Deserialize, Serialize};

/// What a deny rule guards against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCategory {
    ProcessSpawn,
    NetworkSocket,
    RawMemory,
    Filesystem,
    DynamicCode,
}

impl DenyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyCategory::ProcessSpawn => "process spawning",
            DenyCategory::NetworkSocket => "network access",
            DenyCategory::RawMemory => "raw memory access",
            DenyCategory::Filesystem => "filesystem access",
            DenyCategory::DynamicCode => "dynamic code loading",
        }
    }
}

impl std::fmt::Display for DenyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uncompiled deny rule, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    pub category: DenyCategory,
    pub pattern: String,
    pub description: String,
}

impl DenyRule {
    pub fn new(category: DenyCategory, pattern: &str, description: &str) -> Self {
        Self {
            category,
            pattern: pattern.to_string(),
            description: description.to_string(),
        }
    }
}

/// The built-in rules, in scan order. Module-loading rules for specific
/// modules come before the generic `require(` rule so the reason names the
/// more precise category.
pub fn builtin_rules() -> Vec<DenyRule> {
    use DenyCategory::*;

    vec![
        // Process spawning
        DenyRule::new(ProcessSpawn, r#"\bchild_process\b"#, "node child_process module"),
        DenyRule::new(
            ProcessSpawn,
            r"\b(?:execSync|execFile|execFileSync|spawnSync|spawn)\s*\(",
            "process spawn call",
        ),
        DenyRule::new(ProcessSpawn, r"\bprocess\s*\.\s*(?:exit|kill|binding|dlopen)\b", "process control"),
        DenyRule::new(ProcessSpawn, r"\bsubprocess\b|\bos\s*\.\s*(?:system|popen|exec\w*)\b", "python process spawn"),
        DenyRule::new(ProcessSpawn, r"\bCommand\s*::\s*new\b|\bstd\s*::\s*process\b", "rust process spawn"),
        DenyRule::new(ProcessSpawn, r"\bDeno\s*\.\s*(?:run|Command)\b", "deno subprocess"),
        // Network
        DenyRule::new(
            NetworkSocket,
            r#"\brequire\s*\(\s*['"](?:node:)?(?:net|dgram|http|https|http2|tls)['"]"#,
            "node network module",
        ),
        DenyRule::new(NetworkSocket, r"\bnew\s+WebSocket\b|\bXMLHttpRequest\b", "browser socket"),
        DenyRule::new(NetworkSocket, r"\bfetch\s*\(", "fetch call"),
        DenyRule::new(
            NetworkSocket,
            r"\bsocket\s*\.\s*socket\b|\bTcpStream\b|\bUdpSocket\b|\bTcpListener\b",
            "raw socket",
        ),
        // Raw memory
        DenyRule::new(RawMemory, r"\bSharedArrayBuffer\b|\bAtomics\s*\.", "shared memory"),
        DenyRule::new(
            RawMemory,
            r"\bWebAssembly\s*\.\s*(?:Memory|Module|Instance|instantiate|compile)\b",
            "nested wasm instantiation",
        ),
        DenyRule::new(RawMemory, r"\bunsafe\s*\{|\bptr\s*::\s*(?:read|write)\b", "rust unsafe block"),
        DenyRule::new(RawMemory, r"\bctypes\b", "python ctypes"),
        // Filesystem
        DenyRule::new(
            Filesystem,
            r#"\brequire\s*\(\s*['"](?:node:)?fs(?:/promises)?['"]"#,
            "node fs module",
        ),
        DenyRule::new(
            Filesystem,
            r"\bfs\s*\.\s*(?:read|write|append|unlink|rm|mkdir|open|copy|rename|stat)\w*\s*\(",
            "fs call",
        ),
        DenyRule::new(
            Filesystem,
            r"\bDeno\s*\.\s*(?:readFile|readTextFile|writeFile|writeTextFile|open|remove|mkdir)\b",
            "deno filesystem",
        ),
        DenyRule::new(Filesystem, r"\bstd\s*::\s*fs\b", "rust filesystem"),
        DenyRule::new(Filesystem, r#"\(\s*import\s+"wasi[\w-]*""#, "wasi import"),
        // Dynamic code
        DenyRule::new(DynamicCode, r"\beval\s*\(", "eval"),
        DenyRule::new(DynamicCode, r"\bnew\s+Function\s*\(|\bFunction\s*\(\s*['`]", "function constructor"),
        DenyRule::new(
            DynamicCode,
            r#"\bconstructor\s*\.\s*constructor\b|\[\s*['"]constructor['"]\s*\]"#,
            "constructor escape",
        ),
        DenyRule::new(DynamicCode, r"\bimport\s*\(", "dynamic import"),
        DenyRule::new(DynamicCode, r"\brequire\s*\(", "module loading"),
        DenyRule::new(DynamicCode, r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#, "string timer"),
        DenyRule::new(DynamicCode, r"\b__import__\s*\(|\bexec\s*\(\s*compile\b", "python dynamic code"),
    ]
}
