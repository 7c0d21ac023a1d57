//! Named extension points and the set of points a transaction has passed.

/// Point in a transaction where hooks are called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    TxnStart,
    ReadRequestHeaders,
    PreResolve,
    OsResolve,
    PostResolve,
    CacheLookupComplete,
    ReadCacheHeaders,
    SendRequestHeaders,
    ReadResponseHeaders,
    SendResponseHeaders,
    TxnClose,
}

impl HookPoint {
    pub const COUNT: usize = 11;

    pub const ALL: [HookPoint; Self::COUNT] = [
        HookPoint::TxnStart,
        HookPoint::ReadRequestHeaders,
        HookPoint::PreResolve,
        HookPoint::OsResolve,
        HookPoint::PostResolve,
        HookPoint::CacheLookupComplete,
        HookPoint::ReadCacheHeaders,
        HookPoint::SendRequestHeaders,
        HookPoint::ReadResponseHeaders,
        HookPoint::SendResponseHeaders,
        HookPoint::TxnClose,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::TxnStart => "txn_start",
            HookPoint::ReadRequestHeaders => "read_request_headers",
            HookPoint::PreResolve => "pre_resolve",
            HookPoint::OsResolve => "os_resolve",
            HookPoint::PostResolve => "post_resolve",
            HookPoint::CacheLookupComplete => "cache_lookup_complete",
            HookPoint::ReadCacheHeaders => "read_cache_headers",
            HookPoint::SendRequestHeaders => "send_request_headers",
            HookPoint::ReadResponseHeaders => "read_response_headers",
            HookPoint::SendResponseHeaders => "send_response_headers",
            HookPoint::TxnClose => "txn_close",
        }
    }

    /// Points that run again when a redirect is followed.
    pub const PER_ORIGIN: [HookPoint; 8] = [
        HookPoint::PreResolve,
        HookPoint::OsResolve,
        HookPoint::PostResolve,
        HookPoint::CacheLookupComplete,
        HookPoint::ReadCacheHeaders,
        HookPoint::SendRequestHeaders,
        HookPoint::ReadResponseHeaders,
        HookPoint::SendResponseHeaders,
    ];
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bit set of hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookSet(u16);

impl HookSet {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, point: HookPoint) {
        self.0 |= 1 << point.index();
    }

    pub fn remove(&mut self, point: HookPoint) {
        self.0 &= !(1 << point.index());
    }

    pub fn contains(&self, point: HookPoint) -> bool {
        self.0 & (1 << point.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = HookPoint> + '_ {
        HookPoint::ALL.into_iter().filter(|p| self.contains(*p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_follow_declaration_order() {
        for (i, point) in HookPoint::ALL.iter().enumerate() {
            assert_eq!(point.index(), i);
        }
    }

    #[test]
    fn set_operations() {
        let mut set = HookSet::new();
        assert!(set.is_empty());
        set.insert(HookPoint::TxnStart);
        set.insert(HookPoint::PreResolve);
        set.insert(HookPoint::PreResolve);
        assert_eq!(set.len(), 2);
        assert!(set.contains(HookPoint::PreResolve));

        for point in HookPoint::PER_ORIGIN {
            set.remove(point);
        }
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![HookPoint::TxnStart]);
    }
}
