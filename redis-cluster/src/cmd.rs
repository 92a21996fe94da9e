use std::{fmt, io};

use crate::types::{RedisWrite, ToRedisArgs};

/// Represents redis commands.
#[derive(Clone)]
pub struct Cmd {
    data: Vec<u8>,
    // Each entry is the offset that marks the end of the argument
    args: Vec<usize>,
}

#[inline]
fn countdigits(mut v: usize) -> usize {
    let mut result = 1;
    loop {
        if v < 10 {
            return result;
        }
        if v < 100 {
            return result + 1;
        }
        if v < 1000 {
            return result + 2;
        }
        if v < 10000 {
            return result + 3;
        }

        v /= 10000;
        result += 4;
    }
}

#[inline]
fn bulklen(len: usize) -> usize {
    1 + countdigits(len) + 2 + len + 2
}

fn args_len<'a, I>(args: I) -> usize
where
    I: IntoIterator<Item = &'a [u8]> + ExactSizeIterator,
{
    let mut totlen = 1 + countdigits(args.len()) + 2;
    for item in args {
        totlen += bulklen(item.len());
    }
    totlen
}

fn write_command_to_vec<'a, I>(cmd: &mut Vec<u8>, args: I)
where
    I: IntoIterator<Item = &'a [u8]> + Clone + ExactSizeIterator,
{
    let totlen = args_len(args.clone());

    cmd.reserve(totlen);

    // Writing into a Vec cannot fail.
    let _ = write_command(cmd, args);
}

fn write_command<'a, I>(cmd: &mut (impl ?Sized + io::Write), args: I) -> io::Result<()>
where
    I: IntoIterator<Item = &'a [u8]> + Clone + ExactSizeIterator,
{
    let mut buf = ::itoa::Buffer::new();

    cmd.write_all(b"*")?;
    let s = buf.format(args.len());
    cmd.write_all(s.as_bytes())?;
    cmd.write_all(b"\r\n")?;

    for bytes in args {
        cmd.write_all(b"$")?;
        let s = buf.format(bytes.len());
        cmd.write_all(s.as_bytes())?;
        cmd.write_all(b"\r\n")?;

        cmd.write_all(bytes)?;
        cmd.write_all(b"\r\n")?;
    }
    Ok(())
}

impl RedisWrite for Cmd {
    fn write_arg(&mut self, arg: &[u8]) {
        self.data.extend_from_slice(arg);
        self.args.push(self.data.len());
    }

    fn write_arg_fmt(&mut self, arg: impl fmt::Display) {
        use std::io::Write;
        // Writing into a Vec cannot fail.
        let _ = write!(self.data, "{arg}");
        self.args.push(self.data.len());
    }
}

impl Default for Cmd {
    fn default() -> Cmd {
        Cmd::new()
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for arg in self.args_iter() {
            list.entry(&String::from_utf8_lossy(arg));
        }
        list.finish()
    }
}

/// A command acts as a builder interface to creating encoded redis
/// requests.  This allows you to easiy assemble a packed command
/// by chaining arguments together.
///
/// ```rust
/// redis_cluster::cmd("SET").arg("my_key").arg(42);
/// ```
impl Cmd {
    /// Creates a new empty command.
    pub fn new() -> Cmd {
        Cmd {
            data: vec![],
            args: vec![],
        }
    }

    /// Appends an argument to the command.  The argument passed must
    /// be a type that implements `ToRedisArgs`.
    #[inline]
    pub fn arg<T: ToRedisArgs>(&mut self, arg: T) -> &mut Cmd {
        arg.write_redis_args(self);
        self
    }

    /// Returns the packed command as a byte vector.
    #[inline]
    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut cmd = Vec::new();
        self.write_packed_command(&mut cmd);
        cmd
    }

    pub(crate) fn write_packed_command(&self, cmd: &mut Vec<u8>) {
        write_command_to_vec(cmd, self.args_iter())
    }

    /// Returns an iterator over the arguments in this command (including the command name itself)
    pub fn args_iter(&self) -> impl Clone + ExactSizeIterator<Item = &[u8]> {
        let mut prev = 0;
        self.args.iter().map(move |&end| {
            let arg = &self.data[prev..end];
            prev = end;
            arg
        })
    }

    // Get a reference to the argument at `idx`
    pub(crate) fn arg_idx(&self, idx: usize) -> Option<&[u8]> {
        let end = *self.args.get(idx)?;
        let start = if idx == 0 { 0 } else { self.args[idx - 1] };
        Some(&self.data[start..end])
    }
}

/// Shortcut function to creating a command with a single argument.
///
/// The first argument of a redis command is always the name of the command
/// which needs to be a string.
///
/// ```rust
/// redis_cluster::cmd("PING");
/// ```
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

/// Packs a bunch of commands into a request.
///
/// ```rust
/// let cmd = redis_cluster::pack_command(&[b"SET".to_vec(), b"my_key".to_vec(), b"42".to_vec()]);
/// assert_eq!(cmd, b"*3\r\n$3\r\nSET\r\n$6\r\nmy_key\r\n$2\r\n42\r\n".to_vec());
/// ```
pub fn pack_command(args: &[Vec<u8>]) -> Vec<u8> {
    let mut cmd = Vec::new();
    write_command_to_vec(&mut cmd, args.iter().map(|x| &x[..]));
    cmd
}

#[cfg(test)]
mod tests {
    use super::{cmd, Cmd};

    #[test]
    fn test_cmd_arg_idx() {
        let mut c = Cmd::new();
        assert_eq!(c.arg_idx(0), None);

        c.arg("SET");
        assert_eq!(c.arg_idx(0), Some(&b"SET"[..]));
        assert_eq!(c.arg_idx(1), None);

        c.arg("foo").arg("42");
        assert_eq!(c.arg_idx(1), Some(&b"foo"[..]));
        assert_eq!(c.arg_idx(2), Some(&b"42"[..]));
        assert_eq!(c.arg_idx(3), None);
        assert_eq!(c.arg_idx(4), None);
    }

    #[test]
    fn empty_arguments_are_kept() {
        let mut c = cmd("ECHO");
        c.arg("");
        assert_eq!(c.arg_idx(1), Some(&b""[..]));
        assert_eq!(c.get_packed_command(), b"*2\r\n$4\r\nECHO\r\n$0\r\n\r\n");
    }

    #[test]
    fn packs_integers_with_itoa() {
        assert_eq!(
            cmd("EXPIRE").arg("key").arg(10).get_packed_command(),
            b"*3\r\n$6\r\nEXPIRE\r\n$3\r\nkey\r\n$2\r\n10\r\n"
        );
    }
}
