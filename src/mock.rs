//! Scripted in-memory channels standing in for hardware.

use super::*;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// What a mocked serial text device does on the next poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
    Line(String),
    Silence,
    Fault,
}

/// What a mocked register device does on the next exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterEvent {
    Registers(Vec<u16>),
    Exception(String),
    Timeout,
    OpenFailure,
}

#[derive(Debug)]
struct Script<T> {
    queue: VecDeque<T>,
    fallback: Option<T>,
    fail_open: bool,
    delay: Duration,
    opens: usize,
    closes: usize,
    reads: usize,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            fallback: None,
            fail_open: false,
            delay: Duration::ZERO,
            opens: 0,
            closes: 0,
            reads: 0,
        }
    }
}

impl<T: Clone> Script<T> {
    fn next_event(&mut self) -> Option<T> {
        self.reads += 1;
        self.queue.pop_front().or_else(|| self.fallback.clone())
    }
}

/// Handle for scripting a mocked channel and inspecting what happened
/// to it after it has been moved into a reader.
#[derive(Debug)]
pub struct Proxy<T> {
    script: Arc<Mutex<Script<T>>>,
}

impl<T> Clone for Proxy<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<T> Default for Proxy<T> {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
        }
    }
}

impl<T> Proxy<T> {
    fn lock(&self) -> MutexGuard<'_, Script<T>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: T) {
        self.lock().queue.push_back(event);
    }

    /// Event repeated whenever the queue has run dry.
    pub fn set_fallback(&self, event: Option<T>) {
        self.lock().fallback = event;
    }

    pub fn set_open_failure(&self, fail_open: bool) {
        self.lock().fail_open = fail_open;
    }

    /// Time every read takes before it completes.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn reads(&self) -> usize {
        self.lock().reads
    }
}

pub type LineProxy = Proxy<LineEvent>;
pub type RegisterProxy = Proxy<RegisterEvent>;

pub struct MockLineChannel {
    name: String,
    proxy: LineProxy,
    health: ConnectionHealth,
}

impl MockLineChannel {
    pub fn new(name: impl Into<String>) -> (Self, LineProxy) {
        let proxy = LineProxy::default();
        let channel = Self {
            name: name.into(),
            proxy: proxy.clone(),
            health: ConnectionHealth::default(),
        };
        (channel, proxy)
    }
}

#[async_trait]
impl DeviceChannel for MockLineChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> DeviceConnectionState {
        self.health.state()
    }

    fn last_fault(&self) -> Option<DateTime<Utc>> {
        self.health.last_fault()
    }

    async fn close(&mut self) {
        self.proxy.lock().closes += 1;
        self.health.disconnected();
    }
}

#[async_trait]
impl LineChannel for MockLineChannel {
    async fn open(&mut self) -> Result<()> {
        let fail_open = {
            let mut script = self.proxy.lock();
            script.opens += 1;
            script.fail_open
        };
        if fail_open {
            return Err(Error::ChannelOpen {
                port: self.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"),
            });
        }
        self.health.connected();
        Ok(())
    }

    async fn poll_line(&mut self) -> Option<String> {
        let (event, delay) = {
            let mut script = self.proxy.lock();
            (script.next_event(), script.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match event {
            Some(LineEvent::Line(line)) => Some(line),
            Some(LineEvent::Fault) => {
                self.health.faulted();
                None
            }
            Some(LineEvent::Silence) | None => None,
        }
    }
}

pub struct MockRegisterChannel {
    name: String,
    proxy: RegisterProxy,
    health: ConnectionHealth,
}

impl MockRegisterChannel {
    pub fn new(name: impl Into<String>) -> (Self, RegisterProxy) {
        let proxy = RegisterProxy::default();
        let channel = Self {
            name: name.into(),
            proxy: proxy.clone(),
            health: ConnectionHealth::default(),
        };
        (channel, proxy)
    }
}

#[async_trait]
impl DeviceChannel for MockRegisterChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> DeviceConnectionState {
        self.health.state()
    }

    fn last_fault(&self) -> Option<DateTime<Utc>> {
        self.health.last_fault()
    }

    async fn close(&mut self) {
        self.proxy.lock().closes += 1;
        self.health.disconnected();
    }
}

#[async_trait]
impl RegisterChannel for MockRegisterChannel {
    async fn read_registers(&mut self, request: RegisterRequest) -> Result<Vec<u16>> {
        let (event, delay) = {
            let mut script = self.proxy.lock();
            script.opens += 1;
            let event = if script.fail_open {
                Some(RegisterEvent::OpenFailure)
            } else {
                script.next_event()
            };
            (event, script.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = match event {
            Some(RegisterEvent::Registers(registers)) => {
                if registers.len() == usize::from(request.count) {
                    Ok(registers)
                } else {
                    Err(BusError::Malformed {
                        expected: request.count,
                        actual: registers.len(),
                    }
                    .into())
                }
            }
            Some(RegisterEvent::Exception(code)) => Err(BusError::Exception(code).into()),
            Some(RegisterEvent::OpenFailure) => {
                self.health.disconnected();
                return Err(Error::ChannelOpen {
                    port: self.name.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"),
                });
            }
            Some(RegisterEvent::Timeout) | None => Err(BusError::Timeout(delay).into()),
        };
        if result.is_err() {
            self.health.faulted();
        }
        // Per-exchange close, as on the real bus
        self.health.disconnected();
        result
    }
}
