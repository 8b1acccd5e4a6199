/// Identifies a Channel inside the Poller's descriptor map.
///
/// The Poller hands out `Token`s from a `slab`; the slab key doubles as
/// the `u64` payload attached to the kernel epoll event, so looking a
/// ready descriptor back up to its Channel costs one slab index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
