//! 跨 context 的一次性值转移
//!
//! control context 的参数在 `process_load` 时被复制（基本类型）或
//! 以新视图的形式转移（连接、port、环形缓冲区，引用计数 +1）到新的 process context。
//! 任何一个参数不被接受，整个转移失败，已生成的视图全部释放。

use crate::client::{Connection, ConnectionShared};
use crate::error::{Error, Result};
use crate::port::Port;
use crate::ringbuf::RingBuffer;
use crate::shared::Shared;

use super::Value;

/// control context 一侧的参数
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(&'a str),
    /// 复合值，不能跨 context
    List(&'a [Arg<'a>]),
    Connection(&'a Connection),
    Port(&'a Port),
    RingBuffer(&'a RingBuffer),
}

impl Arg<'_> {
    pub fn type_name(&self) -> &'static str {
        match self {
            Arg::Nil => "nil",
            Arg::Boolean(_) => "boolean",
            Arg::Integer(_) => "integer",
            Arg::Number(_) => "number",
            Arg::String(_) => "string",
            Arg::List(_) => "table",
            Arg::Connection(_) => "client",
            Arg::Port(_) => "port",
            Arg::RingBuffer(_) => "ringbuffer",
        }
    }
}

impl From<bool> for Arg<'_> {
    fn from(value: bool) -> Self {
        Arg::Boolean(value)
    }
}

impl From<i64> for Arg<'_> {
    fn from(value: i64) -> Self {
        Arg::Integer(value)
    }
}

impl From<i32> for Arg<'_> {
    fn from(value: i32) -> Self {
        Arg::Integer(value as i64)
    }
}

impl From<u32> for Arg<'_> {
    fn from(value: u32) -> Self {
        Arg::Integer(value as i64)
    }
}

impl From<f64> for Arg<'_> {
    fn from(value: f64) -> Self {
        Arg::Number(value)
    }
}

impl From<f32> for Arg<'_> {
    fn from(value: f32) -> Self {
        Arg::Number(value as f64)
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::String(value)
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(value: &'a String) -> Self {
        Arg::String(value.as_str())
    }
}

impl<'a> From<&'a [Arg<'a>]> for Arg<'a> {
    fn from(value: &'a [Arg<'a>]) -> Self {
        Arg::List(value)
    }
}

impl<'a> From<&'a Connection> for Arg<'a> {
    fn from(value: &'a Connection) -> Self {
        Arg::Connection(value)
    }
}

impl<'a> From<&'a Port> for Arg<'a> {
    fn from(value: &'a Port) -> Self {
        Arg::Port(value)
    }
}

impl<'a> From<&'a RingBuffer> for Arg<'a> {
    fn from(value: &'a RingBuffer) -> Self {
        Arg::RingBuffer(value)
    }
}

/// 把参数转移到 `owner` 的新 process context
///
/// 返回的 slot 0 为 `label`，slot 1.. 依次为参数。
pub(crate) fn transfer(
    owner: &Shared<ConnectionShared>,
    label: String,
    args: &[Arg<'_>],
) -> Result<Vec<Value>> {
    let mut slots = Vec::with_capacity(args.len() + 1);
    slots.push(Value::String(label));

    for (index, arg) in args.iter().enumerate() {
        let position = index + 1;
        let value = match *arg {
            Arg::Nil => Value::Nil,
            Arg::Boolean(b) => Value::Boolean(b),
            Arg::Integer(i) => Value::Integer(i),
            Arg::Number(n) => Value::Number(n),
            Arg::String(s) => Value::String(s.to_string()),
            Arg::Port(port) => {
                if !port.belongs_to_shared(owner) {
                    return Err(Error::Ownership(format!(
                        "port '{}' does not belong to client '{}'",
                        port.name(),
                        owner.name
                    )));
                }
                Value::Port(port.process_view())
            }
            Arg::Connection(connection) => {
                if !Shared::ptr_eq(connection.shared(), owner) {
                    return Err(Error::Ownership(format!(
                        "client '{}' cannot be transferred to process context for client '{}'",
                        connection.name(),
                        owner.name
                    )));
                }
                Value::Connection(connection.process_view())
            }
            Arg::RingBuffer(ring_buffer) => Value::RingBuffer(ring_buffer.process_view()),
            Arg::List(_) => {
                return Err(Error::InvalidType {
                    type_name: arg.type_name(),
                    position,
                })
            }
        };
        slots.push(value);
    }

    Ok(slots)
}
