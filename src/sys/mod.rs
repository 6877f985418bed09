#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{
    from_sockaddr, pipe_pair, set_cloexec, set_nonblocking, socketpair_stream,
    to_sockaddr, Epoll, Poll, Select, Waker,
};
