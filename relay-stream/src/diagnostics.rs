//! 诊断通道
//!
//! 有界的错误/信息通道，写入端从不阻塞：通道已满或已关闭时直接丢弃。
//! 仅用于可观测性，调用方不应依赖其正确性。
//!
use crate::error::StreamError;
use tokio::sync::mpsc;

pub const ERROR_CHANNEL_CAPACITY: usize = 64;
pub const INFO_CHANNEL_CAPACITY: usize = 64;

/// 诊断通道写入端，可在各任务间克隆；全部克隆释放后通道关闭
#[derive(Clone, Debug)]
pub struct Diagnostics {
    errors: mpsc::Sender<StreamError>,
    infos: mpsc::Sender<String>,
}

/// 诊断通道读取端
#[derive(Debug)]
pub struct DiagnosticsReceivers {
    pub errors: mpsc::Receiver<StreamError>,
    pub infos: mpsc::Receiver<String>,
}

impl Diagnostics {
    pub fn new() -> (Self, DiagnosticsReceivers) {
        let (errors, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let (infos, infos_rx) = mpsc::channel(INFO_CHANNEL_CAPACITY);

        (
            Self { errors, infos },
            DiagnosticsReceivers {
                errors: errors_rx,
                infos: infos_rx,
            },
        )
    }

    pub fn push_error(&self, err: StreamError) {
        tracing::debug!(error = %err, "stream diagnostic");
        let _ = self.errors.try_send(err);
    }

    pub fn push_info(&self, info: impl Into<String>) {
        let info = info.into();
        tracing::debug!(%info, "stream diagnostic");
        let _ = self.infos.try_send(info);
    }
}
