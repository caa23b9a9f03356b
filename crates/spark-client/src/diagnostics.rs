//! 诊断快照。
//!
//! 调用失败时只会收到聚合后的 `Unavailable`；每个地址各自失败的原因保存在这里，
//! 供运维排障或测试断言。快照是某一时刻的拷贝，不随后续状态变化更新。

use std::fmt;

use crate::address::Address;
use crate::connectivity::ConnectivityState;
use crate::error::ClientError;
use crate::subconn::{SubConn, SubConnId};

/// ClientConn 级诊断。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostics {
    pub target: String,
    pub state: ConnectivityState,
    /// 当前 Picker 代数。
    pub generation: u64,
    /// 按编号排序的存活子连接。
    pub subconns: Vec<SubConnDiagnostics>,
}

impl Diagnostics {
    /// 按地址查找子连接。
    pub fn subconn(&self, addr: &str) -> Option<&SubConnDiagnostics> {
        self.subconns
            .iter()
            .find(|entry| entry.address.addr() == addr)
    }
}

/// 单个子连接的诊断。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubConnDiagnostics {
    pub id: SubConnId,
    pub address: Address,
    pub state: ConnectivityState,
    pub last_error: Option<ClientError>,
    pub attempts: u64,
}

impl SubConnDiagnostics {
    pub(crate) fn from_subconn(subconn: &SubConn) -> Self {
        Self {
            id: subconn.id(),
            address: subconn.address().clone(),
            state: subconn.state(),
            last_error: subconn.last_error(),
            attempts: subconn.attempts(),
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} state={} generation={}",
            self.target, self.state, self.generation
        )?;
        for entry in &self.subconns {
            write!(
                f,
                "  {} {} state={} attempts={}",
                entry.id, entry.address, entry.state, entry.attempts
            )?;
            if let Some(err) = &entry.last_error {
                write!(f, " last_error=\"{err}\"")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
