/// 步进执行器 - 把阻塞式的一问一答交换变成"提交输入 / 等待结果"两个通道
///
/// `StepRunner` 是控制端（事件循环持有），`StepWorker` 是工作端（独占连接的任务持有）。
/// 两个方向各是一个容量有限（默认1）的 flume 通道，输入与输出严格交替、FIFO。
/// 结果通道上的 `None` 表示工作端已失败或终止，调用方应当视为连接拆除而不是重试。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use crate::error::TransportError;

/// 单步计算
#[async_trait]
pub trait Step<I, O>: Send
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// 执行一步；返回 `None` 表示底层交换已永久失败
    async fn step(&mut self, input: I) -> Option<O>;
}

#[async_trait]
impl<I, O, F, Fut> Step<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut + Send,
    Fut: Future<Output = Option<O>> + Send + 'static,
{
    async fn step(&mut self, input: I) -> Option<O> {
        (self)(input).await
    }
}

/// 控制端
pub struct StepRunner<I, O> {
    /// `stop()` 之后为 None，工作端随之退出
    start: Mutex<Option<flume::Sender<I>>>,
    result: flume::Receiver<Option<O>>,
}

/// 工作端
pub struct StepWorker<I, O> {
    start: flume::Receiver<I>,
    result: flume::Sender<Option<O>>,
}

impl<I, O> StepRunner<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// 创建一对控制端/工作端，`buffer` 为每个方向的通道容量（0 为纯会合）
    pub fn new(buffer: usize) -> (Self, StepWorker<I, O>) {
        let (start_tx, start_rx) = flume::bounded(buffer);
        let (result_tx, result_rx) = flume::bounded(buffer);

        let runner = Self {
            start: Mutex::new(Some(start_tx)),
            result: result_rx,
        };
        let worker = StepWorker {
            start: start_rx,
            result: result_tx,
        };
        (runner, worker)
    }

    /// 创建控制端，并在独立任务上运行 `step` 作为唯一的工作者
    pub fn spawn<S>(buffer: usize, step: S) -> (Self, JoinHandle<()>)
    where
        S: Step<I, O> + 'static,
    {
        let (runner, worker) = Self::new(buffer);
        let handle = tokio::spawn(worker.run(step));
        (runner, handle)
    }

    /// 提交下一个输入
    ///
    /// 调用方必须先消费上一个结果再提交；停止后提交返回 `Stopped`。
    pub async fn submit(&self, input: I) -> Result<(), TransportError> {
        // 锁只保护克隆，不跨越 await
        let sender = self.start.lock().clone().ok_or(TransportError::Stopped)?;
        sender
            .send_async(input)
            .await
            .map_err(|_| TransportError::connection_error("step worker terminated", false))
    }

    /// 等待下一个结果；`None` 表示工作端失败或已退出
    pub async fn await_result(&self) -> Option<O> {
        self.result.recv_async().await.ok().flatten()
    }

    /// 关闭输入通道，工作端完成当前步骤后退出
    pub fn stop(&self) {
        self.start.lock().take();
    }
}

impl<I, O> StepWorker<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// 接收下一个输入；控制端停止或被丢弃时返回 `None`
    pub async fn recv_arg(&self) -> Option<I> {
        self.start.recv_async().await.ok()
    }

    /// 回送一个结果；控制端已丢弃时返回错误
    pub async fn send_result(&self, output: Option<O>) -> Result<(), TransportError> {
        self.result
            .send_async(output)
            .await
            .map_err(|_| TransportError::connection_error("step runner dropped", false))
    }

    /// 工作循环：读输入，执行一步，写结果；输入通道关闭时退出
    pub async fn run<S>(self, mut step: S)
    where
        S: Step<I, O>,
    {
        while let Some(input) = self.recv_arg().await {
            let output = step.step(input).await;
            if self.send_result(output).await.is_err() {
                break;
            }
        }
        tracing::debug!("🛑 步进工作者退出");
    }
}
