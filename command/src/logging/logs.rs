use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    net::{SocketAddr, TcpStream, UdpSocket},
    str::FromStr,
};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::logging::LogError;

/// Where the log lines end up
pub enum LoggerBackend {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(BufWriter<File>),
    Udp(UdpSocket, SocketAddr),
    Tcp(TcpStream),
}

impl LoggerBackend {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        match self {
            LoggerBackend::Stdout(stdout) => stdout.lock().write_all(line),
            LoggerBackend::Stderr(stderr) => stderr.lock().write_all(line),
            LoggerBackend::File(writer) => writer.write_all(line),
            LoggerBackend::Udp(socket, address) => socket.send_to(line, *address).map(|_| ()),
            LoggerBackend::Tcp(stream) => stream.write_all(line),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LoggerBackend::Stdout(stdout) => stdout.flush(),
            LoggerBackend::Stderr(stderr) => stderr.flush(),
            LoggerBackend::File(writer) => writer.flush(),
            LoggerBackend::Udp(..) => Ok(()),
            LoggerBackend::Tcp(stream) => stream.flush(),
        }
    }
}

/// One `module=level` element of a level specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub name: Option<String>,
    pub level: LevelFilter,
}

/// Parses `info,fwdproxy_lib::request=debug,mio=off`.
///
/// A bare level applies to every module. Unknown levels yield
/// [`LogError::InvalidDirective`].
pub fn parse_logging_spec(spec: &str) -> Result<Vec<LogDirective>, LogError> {
    let mut directives = Vec::new();

    for part in spec.split(',').map(str::trim).filter(|part| !part.is_empty()) {
        let mut pieces = part.splitn(2, '=');
        let first = pieces.next().unwrap_or_default();
        let directive = match pieces.next() {
            Some(level) => LogDirective {
                name: Some(first.to_owned()),
                level: LevelFilter::from_str(level.trim())
                    .map_err(|_| LogError::InvalidDirective(part.to_owned()))?,
            },
            None => match LevelFilter::from_str(first) {
                Ok(level) => LogDirective { name: None, level },
                // a lone module name enables everything for it
                Err(_) => LogDirective {
                    name: Some(first.to_owned()),
                    level: LevelFilter::Trace,
                },
            },
        };
        directives.push(directive);
    }

    // longest names last so lookups can scan from the end
    directives.sort_by_key(|directive| directive.name.as_ref().map(String::len).unwrap_or(0));
    Ok(directives)
}

pub struct Logger {
    backend: Mutex<LoggerBackend>,
    directives: Vec<LogDirective>,
    tag: String,
    pid: u32,
}

impl Logger {
    pub fn new(backend: LoggerBackend, directives: Vec<LogDirective>, tag: String) -> Self {
        Logger {
            backend: Mutex::new(backend),
            directives,
            tag,
            pid: std::process::id(),
        }
    }

    pub fn max_level(&self) -> LevelFilter {
        self.directives
            .iter()
            .map(|directive| directive.level)
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn level_for(&self, target: &str) -> LevelFilter {
        for directive in self.directives.iter().rev() {
            match &directive.name {
                Some(name) if !target.starts_with(name.as_str()) => continue,
                _ => return directive.level,
            }
        }
        LevelFilter::Off
    }

    fn format(&self, record: &Record) -> String {
        let now = OffsetDateTime::now_utc();
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z {} {} {}\t{}\n",
            now.year(),
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.microsecond(),
            self.pid,
            self.tag,
            record.level(),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        let mut backend = self.backend.lock();
        // nowhere to report a failing logger
        let _ = backend.write_line(line.as_bytes());
        // buffered lines up to a warning survive an abrupt exit
        if record.level() <= Level::Warn {
            let _ = backend.flush();
        }
    }

    fn flush(&self) {
        let _ = self.backend.lock().flush();
    }
}

/// `stdout`, `stderr`, `file://<path>`, `udp://<address>` or `tcp://<address>`
pub fn target_to_backend(target: &str) -> Result<LoggerBackend, LogError> {
    if target == "stdout" {
        return Ok(LoggerBackend::Stdout(io::stdout()));
    }
    if target == "stderr" {
        return Ok(LoggerBackend::Stderr(io::stderr()));
    }

    if let Some(path) = target.strip_prefix("file://") {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|error| LogError::OpenFile(path.to_owned(), error))?;
        return Ok(LoggerBackend::File(BufWriter::new(file)));
    }

    if let Some(address) = target.strip_prefix("udp://") {
        let address: SocketAddr = address
            .parse()
            .map_err(|error| LogError::InvalidSocketAddress(target.to_owned(), error))?;
        let local: SocketAddr = if address.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).map_err(LogError::UdpBind)?;
        return Ok(LoggerBackend::Udp(socket, address));
    }

    if let Some(address) = target.strip_prefix("tcp://") {
        let address: SocketAddr = address
            .parse()
            .map_err(|error| LogError::InvalidSocketAddress(target.to_owned(), error))?;
        let stream = TcpStream::connect(address)
            .map_err(|error| LogError::TcpConnect(target.to_owned(), error))?;
        return Ok(LoggerBackend::Tcp(stream));
    }

    Err(LogError::InvalidLogTarget(
        target.to_owned(),
        "expected stdout, stderr, file://, udp:// or tcp://",
    ))
}

/// Installs the process logger. Fails if one is already in place.
pub fn setup_logging(target: &str, spec: &str, tag: &str) -> Result<(), LogError> {
    let backend = target_to_backend(target)?;
    let directives = parse_logging_spec(spec)?;
    let logger = Logger::new(backend, directives, tag.to_owned());
    let max_level = logger.max_level();

    log::set_boxed_logger(Box::new(logger)).map_err(|_| LogError::AlreadyInstalled)?;
    log::set_max_level(max_level);
    Ok(())
}

/// Test helper: tries to install a stderr logger at the given level and
/// silently keeps the existing one otherwise
pub fn setup_test_logger(spec: &str) {
    let _ = setup_logging("stderr", spec, "TEST");
}
