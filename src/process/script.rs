//! process chunk 的编译与执行
//!
//! `ScriptEngine` 把 chunk 文本或文件编译成 `Chunk`，`Chunk` 的 top-level body
//! 在新的 process context 中执行一次。嵌入方可以接入自己的解释器。
//!
//! 内置的 `Routines` 引擎：chunk 的第一条语句是一个 routine 名，
//! 在注册表中查找对应的 Rust routine。空行和注释行（`#`、`--`）被跳过。

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::ProcessContext;

/// chunk 来源
#[derive(Debug, Clone)]
pub enum ScriptSource {
    Chunk(String),
    File(PathBuf),
}

impl ScriptSource {
    /// 读出 chunk 文本
    pub fn text(&self) -> Result<Cow<'_, str>> {
        match self {
            ScriptSource::Chunk(text) => Ok(Cow::Borrowed(text.as_str())),
            ScriptSource::File(path) => Ok(Cow::Owned(std::fs::read_to_string(path)?)),
        }
    }
}

/// 编译好的 chunk
pub trait Chunk: Send {
    /// 执行 top-level body 一次
    fn execute(self: Box<Self>, ctx: &mut ProcessContext) -> anyhow::Result<()>;
}

pub trait ScriptEngine: Send + Sync {
    fn compile(&self, source: &ScriptSource) -> Result<Box<dyn Chunk>>;
}

pub type Routine = Arc<dyn Fn(&mut ProcessContext) -> anyhow::Result<()> + Send + Sync>;

/// 以名字查找 Rust routine 的引擎
#[derive(Clone, Default)]
pub struct Routines {
    table: HashMap<String, Routine>,
}

impl Routines {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册（或替换）一个 routine
    pub fn register<F>(&mut self, name: &str, routine: F) -> &mut Self
    where
        F: Fn(&mut ProcessContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.table.insert(name.to_string(), Arc::new(routine));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// 已注册的名字（排序）
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// chunk 的第一条语句
    fn first_statement(text: &str) -> Option<&str> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("--"))
            .find_map(|line| line.split_whitespace().next())
    }
}

impl fmt::Debug for Routines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routines")
            .field("names", &self.names())
            .finish()
    }
}

struct RoutineChunk {
    routine: Routine,
}

impl Chunk for RoutineChunk {
    fn execute(self: Box<Self>, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        (self.routine)(ctx)
    }
}

impl ScriptEngine for Routines {
    fn compile(&self, source: &ScriptSource) -> Result<Box<dyn Chunk>> {
        let text = source.text()?;
        let name = Self::first_statement(&text)
            .ok_or_else(|| Error::Script("empty process chunk".to_string()))?;
        let routine = self
            .table
            .get(name)
            .ok_or_else(|| Error::Script(format!("unknown routine '{}'", name)))?;
        Ok(Box::new(RoutineChunk {
            routine: Arc::clone(routine),
        }))
    }
}
