//! Handing listening sockets to a new process, for restarts without downtime.
//!
//! The parent duplicates its listeners' descriptors and starts the child with
//! [Inheritance::command]. The descriptors land on consecutive numbers in the child, and a flag of
//! the form `-<name>=<start>-<end>` tells it where (`end` is exclusive). The child rebuilds its
//! listeners with [Inheritance::retrieve], starts accepting, and signals the parent, which then
//! closes its own [ThrottledListener](crate::ThrottledListener)s and waits for them to drain.
//!
//! Parsing the command line is left to the application; [Inheritance::flag_value] only picks the
//! flag out of an argument list.

use std::{
    ffi::OsStr,
    fmt, io, mem,
    ops::Range,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::process::CommandExt,
    },
    path::PathBuf,
    process::{Child, Command},
    str::FromStr,
};

use conv::ValueFrom;
use tokio::net::{TcpListener, UnixListener};
use tracing::debug;

use crate::{
    net::{Address, Listener, TcpAcceptor, UnixAcceptor},
    ThrottledListener,
};

/// The default name of the flag describing inherited descriptors.
pub const DEFAULT_FDS_FLAG: &str = "listener-throttle.fds";

/// Descriptors 0-2 are stdio.
const FIRST_INHERITED_FD: RawFd = 3;

/// Listeners whose descriptor can be duplicated.
pub trait DupFd {
    /// Duplicate the listening socket's descriptor.
    ///
    /// The duplicate refers to the same socket, and is closed on exec.
    fn dup_fd(&self) -> io::Result<OwnedFd>;
}

/// Errors from passing listeners between processes.
#[derive(Debug, thiserror::Error)]
pub enum InheritError {
    /// No inherited descriptors were described.
    #[error("executing without inherited listeners")]
    NotInherited,

    /// The descriptor range could not be parsed.
    #[error("malformed inherited descriptor range {0:?}")]
    Malformed(String),

    /// The range ends before it starts.
    #[error("invalid inherited descriptor range {start}-{end}")]
    InvalidRange {
        /// The first descriptor.
        start: RawFd,
        /// One past the last descriptor.
        end: RawFd,
    },

    /// One of the inherited descriptors could not be turned back into a listener.
    ///
    /// Any listeners rebuilt before it have been closed.
    #[error("failed to rebuild inherited listener #{index} from fd {fd}")]
    Reconstruct {
        /// The offending descriptor.
        fd: RawFd,
        /// Its position within the range.
        index: usize,
        /// Why it could not be rebuilt.
        #[source]
        source: io::Error,
    },

    /// Too many descriptors to number consecutively.
    #[error("too many descriptors to pass: {0}")]
    TooMany(usize),

    /// Duplicating a descriptor failed.
    #[error("failed to duplicate listener descriptor")]
    Dup(#[source] io::Error),

    /// The path of the running executable could not be determined.
    #[error("failed to locate the current executable")]
    CurrentExe(#[source] io::Error),
}

/// A consecutive range of inherited descriptors, `start` inclusive and `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdRange {
    start: RawFd,
    end: RawFd,
}

/// Where to find inherited descriptors on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inheritance {
    flag_name: String,
}

/// A listener rebuilt from an inherited descriptor.
#[derive(Debug)]
pub enum InheritedListener {
    /// A TCP listener.
    Tcp(TcpAcceptor),
    /// A Unix domain socket listener.
    Unix(UnixAcceptor),
}

/// A child process, ready to start, which will inherit listeners.
#[derive(Debug)]
pub struct InheritedCommand {
    command: Command,
    /// Kept open until the child has been started.
    fds: Vec<OwnedFd>,
    range: FdRange,
}

impl FdRange {
    /// Descriptors `start..end`.
    pub fn new(start: RawFd, end: RawFd) -> Result<Self, InheritError> {
        if start < 0 {
            return Err(InheritError::Malformed(format!("{start}-{end}")));
        }
        if end < start {
            return Err(InheritError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// The first descriptor in the range.
    pub fn start(&self) -> RawFd {
        self.start
    }

    /// One past the last descriptor in the range.
    pub fn end(&self) -> RawFd {
        self.end
    }

    /// The number of descriptors in the range.
    pub fn len(&self) -> usize {
        self.fds().len()
    }

    /// Whether the range holds no descriptors. The flag was present but nothing was passed.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The descriptors in the range, in order.
    pub fn fds(&self) -> Range<RawFd> {
        self.start..self.end
    }
}

impl FromStr for FdRange {
    type Err = InheritError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || InheritError::Malformed(s.to_owned());

        let (start, end) = s.trim().split_once('-').ok_or_else(malformed)?;
        let start = start.parse().map_err(|_| malformed())?;
        let end = end.parse().map_err(|_| malformed())?;

        Self::new(start, end)
    }
}

impl fmt::Display for FdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl Default for Inheritance {
    fn default() -> Self {
        Self::new(DEFAULT_FDS_FLAG)
    }
}

impl Inheritance {
    /// Use a flag called `flag_name`.
    pub fn new(flag_name: impl Into<String>) -> Self {
        Self {
            flag_name: flag_name.into(),
        }
    }

    /// The name of the flag, without leading dashes.
    pub fn flag_name(&self) -> &str {
        &self.flag_name
    }

    /// The flag passed to a child inheriting `range`.
    pub fn flag(&self, range: FdRange) -> String {
        format!("-{}={}", self.flag_name, range)
    }

    /// Find the flag's value in `args`. Both `-name=value` and `--name=value` are recognised.
    pub fn flag_value<I, S>(&self, args: I) -> Option<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        args.into_iter().find_map(|arg| {
            let arg = arg.as_ref();
            let arg = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-'))?;
            arg.strip_prefix(self.flag_name.as_str())?
                .strip_prefix('=')
                .map(str::to_owned)
        })
    }

    /// Find the flag's value in this process's arguments.
    pub fn flag_value_from_env(&self) -> Option<String> {
        self.flag_value(
            std::env::args_os()
                .skip(1)
                .filter_map(|arg| arg.into_string().ok()),
        )
    }

    /// Parse the descriptor range from the flag's value.
    pub fn range(&self, value: Option<&str>) -> Result<FdRange, InheritError> {
        match value {
            None | Some("") => Err(InheritError::NotInherited),
            Some(value) => value.parse(),
        }
    }

    /// Whether the flag's value describes inherited listeners, possibly none.
    pub fn can_retrieve(&self, value: Option<&str>) -> bool {
        self.range(value).is_ok()
    }

    /// Rebuild the listeners described by the flag's value, in order.
    ///
    /// Either every listener is rebuilt or none is: on failure the listeners already rebuilt are
    /// closed. Must be called from within a tokio runtime, and at most once per process, as the
    /// listeners take ownership of the inherited descriptors.
    pub fn retrieve(&self, value: Option<&str>) -> Result<Vec<InheritedListener>, InheritError> {
        let range = self.range(value)?;

        let mut listeners = Vec::with_capacity(range.len());
        for (index, fd) in range.fds().enumerate() {
            let listener =
                rebuild(fd).map_err(|source| InheritError::Reconstruct { fd, index, source })?;

            debug!(fd, addr = %listener.address(), "rebuilt inherited listener");
            listeners.push(listener);
        }

        Ok(listeners)
    }

    /// Rebuild the listeners described by this process's arguments.
    ///
    /// See [Inheritance::retrieve].
    pub fn retrieve_from_env(&self) -> Result<Vec<InheritedListener>, InheritError> {
        self.retrieve(self.flag_value_from_env().as_deref())
    }

    /// Prepare a child process which inherits `listeners`.
    ///
    /// `program` defaults to the running executable. `extra_fds` become the child's descriptors
    /// from 3 onwards, followed by the listeners. The child's arguments are the inheritance flag
    /// followed by `args`, and it shares this process's stdio.
    pub fn command<I, S>(
        &self,
        program: Option<PathBuf>,
        args: I,
        extra_fds: Vec<OwnedFd>,
        listeners: &[&dyn DupFd],
    ) -> Result<InheritedCommand, InheritError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = match program {
            Some(program) => program,
            None => std::env::current_exe().map_err(InheritError::CurrentExe)?,
        };

        let total = extra_fds.len() + listeners.len();
        let count = |n: usize| RawFd::value_from(n).map_err(|_| InheritError::TooMany(total));
        let start = FIRST_INHERITED_FD + count(extra_fds.len())?;
        let end = start + count(listeners.len())?;
        let floor = end;
        let range = FdRange::new(start, end)?;

        // Everything is staged above the target range, so placing one descriptor in the child
        // cannot clobber another.
        let mut fds = Vec::with_capacity(total);
        for fd in &extra_fds {
            fds.push(dup_above(fd.as_fd(), floor).map_err(InheritError::Dup)?);
        }
        drop(extra_fds);
        for listener in listeners {
            let dup = listener.dup_fd().map_err(InheritError::Dup)?;
            fds.push(dup_above(dup.as_fd(), floor).map_err(InheritError::Dup)?);
        }

        let mut command = Command::new(&program);
        command.arg(self.flag(range)).args(args);

        let staged: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        // SAFETY: only async-signal-safe calls, and no allocation, between fork and exec.
        unsafe {
            command.pre_exec(move || {
                for (target, &fd) in (FIRST_INHERITED_FD..).zip(&staged) {
                    // dup2 leaves close-on-exec unset on the target.
                    if libc::dup2(fd, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        debug!(
            program = %program.display(),
            fds = %range,
            extra = total - listeners.len(),
            "prepared command inheriting listeners"
        );

        Ok(InheritedCommand {
            command,
            fds,
            range,
        })
    }
}

impl InheritedCommand {
    /// The command, for further configuration.
    ///
    /// Changing its arguments or descriptors may break inheritance.
    pub fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    /// The descriptors the child will receive, starting at 3.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Where the inherited listeners will be in the child.
    pub fn range(&self) -> FdRange {
        self.range
    }

    /// Start the child. Our copies of the passed descriptors are closed afterwards.
    pub fn spawn(mut self) -> io::Result<Child> {
        self.command.spawn()
    }
}

impl InheritedListener {
    /// The TCP listener, if this is one.
    pub fn into_tcp(self) -> Option<TcpAcceptor> {
        match self {
            InheritedListener::Tcp(listener) => Some(listener),
            InheritedListener::Unix(_) => None,
        }
    }

    /// The Unix domain socket listener, if this is one.
    pub fn into_unix(self) -> Option<UnixAcceptor> {
        match self {
            InheritedListener::Unix(listener) => Some(listener),
            InheritedListener::Tcp(_) => None,
        }
    }

    /// The local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<Address> {
        match self {
            InheritedListener::Tcp(listener) => listener.local_addr(),
            InheritedListener::Unix(listener) => listener.local_addr(),
        }
    }

    fn address(&self) -> Address {
        self.local_addr().unwrap_or(Address::Unknown)
    }
}

impl DupFd for TcpAcceptor {
    fn dup_fd(&self) -> io::Result<OwnedFd> {
        self.listener()?.as_fd().try_clone_to_owned()
    }
}

impl DupFd for UnixAcceptor {
    fn dup_fd(&self) -> io::Result<OwnedFd> {
        self.listener()?.as_fd().try_clone_to_owned()
    }
}

impl DupFd for InheritedListener {
    fn dup_fd(&self) -> io::Result<OwnedFd> {
        match self {
            InheritedListener::Tcp(listener) => listener.dup_fd(),
            InheritedListener::Unix(listener) => listener.dup_fd(),
        }
    }
}

impl<L> DupFd for ThrottledListener<L>
where
    L: Listener + DupFd,
{
    fn dup_fd(&self) -> io::Result<OwnedFd> {
        self.get_ref().dup_fd()
    }
}

enum Family {
    Inet,
    Unix,
}

fn rebuild(fd: RawFd) -> io::Result<InheritedListener> {
    let family = socket_family(fd)?;

    // SAFETY: `fd` is an open socket, handed to this process for it to own.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    match family {
        Family::Inet => {
            let listener = std::net::TcpListener::from(owned);
            listener.set_nonblocking(true)?;
            Ok(InheritedListener::Tcp(TcpAcceptor::new(
                TcpListener::from_std(listener)?,
            )))
        }
        Family::Unix => {
            let listener = std::os::unix::net::UnixListener::from(owned);
            listener.set_nonblocking(true)?;
            Ok(InheritedListener::Unix(UnixAcceptor::new(
                UnixListener::from_std(listener)?,
            )))
        }
    }
}

/// Check `fd` is an open socket we know how to listen on.
fn socket_family(fd: RawFd) -> io::Result<Family> {
    // SAFETY: fstat writes into the zeroed buffer and does not retain it.
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("fd {fd} is not a socket"),
        ));
    }

    // SAFETY: as above, for getsockname.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = libc::socklen_t::value_from(mem::size_of::<libc::sockaddr_storage>())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "socket address too large"))?;
    let named = unsafe {
        libc::getsockname(
            fd,
            (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
            &mut len,
        )
    };
    if named != 0 {
        return Err(io::Error::last_os_error());
    }

    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET | libc::AF_INET6 => Ok(Family::Inet),
        libc::AF_UNIX => Ok(Family::Unix),
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("fd {fd} has unsupported socket family {family}"),
        )),
    }
}

/// Duplicate `fd` onto the lowest free descriptor not below `floor`, close-on-exec.
fn dup_above(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC only allocates a new descriptor.
    let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `dup` is a fresh descriptor nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}
