//! Admission checks: liveness, secrets, capacity and network scope.
//!
//! Check order for a join is: expired, secret, network scope, capacity.
//! The registry runs [`AccessGate::admit`] while holding the room's member
//! lock and inserts the member before releasing it, so no two joiners can
//! both take the last slot.
//!
//! Network scope is convenience filtering for "people on the same LAN".
//! Addresses are trivially spoofable behind a trusting proxy; it is not an
//! authentication mechanism.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::{ForbiddenReason, SessionError};
use crate::membership::Membership;
use crate::room::{ConnectionId, RoomRecord, TrustMode};
use crate::secret::SecretHash;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub secret: Option<String>,
}

impl Credentials {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }
}

/// Addresses considered "the same network": IPv4 /24 or IPv6 /64.
/// IPv4-mapped IPv6 addresses are classified as IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkClass {
    V4([u8; 3]),
    V6([u16; 4]),
}

impl NetworkClass {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::of_v4(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::of_v4(v4),
                None => {
                    let s = v6.segments();
                    NetworkClass::V6([s[0], s[1], s[2], s[3]])
                }
            },
        }
    }

    fn of_v4(addr: Ipv4Addr) -> Self {
        let [a, b, c, _] = addr.octets();
        NetworkClass::V4([a, b, c])
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        NetworkClass::of(addr) == *self
    }
}

impl std::fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkClass::V4([a, b, c]) => write!(f, "{a}.{b}.{c}.0/24"),
            NetworkClass::V6([a, b, c, d]) => {
                write!(f, "{}/64", Ipv6Addr::new(*a, *b, *c, *d, 0, 0, 0, 0))
            }
        }
    }
}

impl FromStr for NetworkClass {
    type Err = String;

    /// Accepts a bare address or `address/24` (IPv4) / `address/64` (IPv6).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let ip: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| format!("invalid address in network class {s:?}"))?;
        let expected = if ip.is_ipv4() { "24" } else { "64" };
        match prefix {
            Some(p) if p.trim() != expected => {
                Err(format!("network class {s:?} must use a /{expected} prefix"))
            }
            _ => Ok(NetworkClass::of(ip)),
        }
    }
}

/// Outcome of a scope check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDecision {
    Accepted,
    Rejected,
    /// Nothing configured for the room yet; the joiner may claim it.
    Unclaimed,
}

/// Pluggable network-scope rule for scoped rooms.
pub trait ScopePolicy: Send + Sync {
    fn decide(&self, room_id: &str, class: NetworkClass) -> ScopeDecision;

    /// Make `class` the accepted class of an unclaimed room.
    fn bootstrap(&self, room_id: &str, class: NetworkClass);

    /// Forget what the room accepted; the next joiner claims it again.
    fn reset(&self, room_id: &str);

    fn accepted_classes(&self, room_id: &str) -> Vec<NetworkClass>;
}

/// Subnet-equivalence policy.
///
/// A room accepts the configured allowlist plus whatever class it was
/// bootstrapped with. With an empty allowlist the first joiner's class is
/// bootstrapped; with a non-empty allowlist nothing is ever bootstrapped.
#[derive(Default)]
pub struct SubnetPolicy {
    allowlist: BTreeSet<NetworkClass>,
    claimed: Mutex<HashMap<String, BTreeSet<NetworkClass>>>,
}

impl SubnetPolicy {
    pub fn new(allowlist: impl IntoIterator<Item = NetworkClass>) -> Self {
        Self {
            allowlist: allowlist.into_iter().collect(),
            claimed: Mutex::new(HashMap::new()),
        }
    }

    fn with_claimed<T>(&self, f: impl FnOnce(&mut HashMap<String, BTreeSet<NetworkClass>>) -> T) -> T {
        // A poisoned map only ever holds fully inserted sets.
        let mut guard = match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl ScopePolicy for SubnetPolicy {
    fn decide(&self, room_id: &str, class: NetworkClass) -> ScopeDecision {
        if self.allowlist.contains(&class) {
            return ScopeDecision::Accepted;
        }
        self.with_claimed(|claimed| match claimed.get(room_id) {
            Some(set) if set.contains(&class) => ScopeDecision::Accepted,
            Some(set) if !set.is_empty() => ScopeDecision::Rejected,
            _ if self.allowlist.is_empty() => ScopeDecision::Unclaimed,
            _ => ScopeDecision::Rejected,
        })
    }

    fn bootstrap(&self, room_id: &str, class: NetworkClass) {
        let inserted = self.with_claimed(|claimed| claimed.entry(room_id.to_string()).or_default().insert(class));
        if inserted {
            log::info!("Scope of room {room_id} bootstrapped to {class}");
        }
    }

    fn reset(&self, room_id: &str) {
        if let Some(prev) = self.with_claimed(|claimed| claimed.remove(room_id)) {
            let shown: Vec<String> = prev.iter().map(ToString::to_string).collect();
            log::info!("Scope of room {room_id} reset (was {})", shown.join(", "));
        }
    }

    fn accepted_classes(&self, room_id: &str) -> Vec<NetworkClass> {
        let mut all = self.allowlist.clone();
        self.with_claimed(|claimed| {
            if let Some(set) = claimed.get(room_id) {
                all.extend(set.iter().copied());
            }
        });
        all.into_iter().collect()
    }
}

/// What the gate needs to know about the room being joined.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionTarget<'a> {
    pub room_id: &'a str,
    pub mode: TrustMode,
    pub secret: Option<&'a SecretHash>,
    /// `None` for rooms that never expire.
    pub expires_at: Option<u64>,
    pub max_users: usize,
}

impl<'a> AdmissionTarget<'a> {
    pub fn for_record(record: &'a RoomRecord) -> Self {
        Self {
            room_id: &record.id,
            mode: record.mode,
            secret: record.secret.as_ref(),
            expires_at: Some(record.expires_at),
            max_users: record.policy.max_users,
        }
    }
}

/// Scope claim to confirm once the member is actually inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeClaim {
    pub class: NetworkClass,
    pub bootstrap: bool,
}

pub struct AccessGate {
    scope: Box<dyn ScopePolicy>,
}

impl AccessGate {
    pub fn new(scope: Box<dyn ScopePolicy>) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &dyn ScopePolicy {
        self.scope.as_ref()
    }

    /// Liveness and secret checks. Shared by joins and catalog reads.
    pub fn check_credentials(
        &self,
        target: &AdmissionTarget<'_>,
        credentials: &Credentials,
        now: u64,
    ) -> Result<(), SessionError> {
        if matches!(target.expires_at, Some(at) if now > at) {
            return Err(SessionError::Expired);
        }
        if target.mode == TrustMode::Private {
            let ok = match (target.secret, credentials.secret.as_deref()) {
                (Some(hash), Some(candidate)) => hash.verify(candidate),
                _ => false,
            };
            if !ok {
                return Err(SessionError::Unauthorized);
            }
        }
        Ok(())
    }

    pub fn check_record(&self, record: &RoomRecord, credentials: &Credentials, now: u64) -> Result<(), SessionError> {
        self.check_credentials(&AdmissionTarget::for_record(record), credentials, now)
    }

    /// Admission decision for `conn` against the current membership.
    ///
    /// Secrets are not checked here: bcrypt is too slow to run under the
    /// member lock, so callers run [`AccessGate::check_credentials`] first.
    /// Must be called with the room's member lock held; the caller inserts
    /// the member and then passes the returned claim to
    /// [`AccessGate::confirm`] under the same lock.
    pub fn admit(
        &self,
        target: &AdmissionTarget<'_>,
        origin: Option<IpAddr>,
        membership: &Membership,
        conn: ConnectionId,
        now: u64,
    ) -> Result<Option<ScopeClaim>, SessionError> {
        if matches!(target.expires_at, Some(at) if now > at) {
            return Err(SessionError::Expired);
        }

        let claim = if target.mode == TrustMode::Scoped {
            let class = origin
                .map(NetworkClass::of)
                .ok_or(SessionError::Forbidden(ForbiddenReason::NetworkScope))?;
            match self.scope.decide(target.room_id, class) {
                ScopeDecision::Accepted => Some(ScopeClaim { class, bootstrap: false }),
                ScopeDecision::Unclaimed => Some(ScopeClaim { class, bootstrap: true }),
                ScopeDecision::Rejected => {
                    log::info!("Rejected {class} from scoped room {}", target.room_id);
                    return Err(SessionError::Forbidden(ForbiddenReason::NetworkScope));
                }
            }
        } else {
            None
        };

        if !membership.contains(conn) && membership.len() >= target.max_users {
            return Err(SessionError::Forbidden(ForbiddenReason::Capacity));
        }

        Ok(claim)
    }

    pub fn confirm(&self, room_id: &str, claim: Option<ScopeClaim>) {
        if let Some(ScopeClaim { class, bootstrap: true }) = claim {
            self.scope.bootstrap(room_id, class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::fixtures::hash;
    use crate::room::fixtures::record;
    use crate::room::Member;
    use uuid::Uuid;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    fn scoped(max_users: usize) -> AdmissionTarget<'static> {
        AdmissionTarget {
            room_id: "local-network",
            mode: TrustMode::Scoped,
            secret: None,
            expires_at: None,
            max_users,
        }
    }

    fn gate() -> AccessGate {
        AccessGate::new(Box::new(SubnetPolicy::default()))
    }

    #[test]
    fn test_network_class_v4() {
        let a = NetworkClass::of("192.168.1.10".parse().unwrap());
        let b = NetworkClass::of("192.168.1.250".parse().unwrap());
        let c = NetworkClass::of("192.168.2.10".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "192.168.1.0/24");
    }

    #[test]
    fn test_network_class_v6_and_mapped() {
        let a = NetworkClass::of("2001:db8:1:2:aaaa::1".parse().unwrap());
        let b = NetworkClass::of("2001:db8:1:2:bbbb::2".parse().unwrap());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "2001:db8:1:2::/64");

        let mapped = NetworkClass::of("::ffff:10.0.0.7".parse().unwrap());
        assert_eq!(mapped, NetworkClass::of("10.0.0.99".parse().unwrap()));
    }

    #[test]
    fn test_network_class_parse() {
        assert_eq!("10.1.2.0/24".parse::<NetworkClass>().unwrap(), NetworkClass::V4([10, 1, 2]));
        assert_eq!("10.1.2.3".parse::<NetworkClass>().unwrap(), NetworkClass::V4([10, 1, 2]));
        assert!("10.1.2.0/16".parse::<NetworkClass>().is_err());
        assert!("nonsense".parse::<NetworkClass>().is_err());
    }

    #[test]
    fn test_private_requires_correct_secret() {
        let mut rec = record("0123456789abcdef");
        rec.mode = TrustMode::Private;
        rec.secret = Some(hash("abc123"));
        let gate = gate();
        let now = rec.created_at;

        assert_eq!(gate.check_record(&rec, &Credentials::none(), now), Err(SessionError::Unauthorized));
        assert_eq!(gate.check_record(&rec, &Credentials::secret("nope"), now), Err(SessionError::Unauthorized));
        assert_eq!(gate.check_record(&rec, &Credentials::secret("abc123"), now), Ok(()));
    }

    #[test]
    fn test_public_with_secret_needs_none() {
        let mut rec = record("0123456789abcdef");
        rec.secret = Some(hash("abc123"));
        assert!(gate().check_record(&rec, &Credentials::none(), rec.created_at).is_ok());
    }

    #[test]
    fn test_expired_before_secret() {
        let mut rec = record("0123456789abcdef");
        rec.mode = TrustMode::Private;
        rec.secret = Some(hash("abc123"));
        let after = rec.expires_at + 1;
        assert_eq!(gate().check_record(&rec, &Credentials::none(), after), Err(SessionError::Expired));
    }

    #[test]
    fn test_capacity_check() {
        let gate = gate();
        let mut members = Membership::new();
        let target = AdmissionTarget {
            mode: TrustMode::Public,
            ..scoped(1)
        };
        let first = Uuid::new_v4();
        members.join(Member::new(first, None, None), 1).unwrap();

        assert_eq!(
            gate.admit(&target, None, &members, Uuid::new_v4(), 0),
            Err(SessionError::Forbidden(ForbiddenReason::Capacity))
        );
        // Already a member: not counted twice.
        assert!(gate.admit(&target, None, &members, first, 0).is_ok());
    }

    #[test]
    fn test_scope_bootstrap_then_filter() {
        let gate = gate();
        let members = Membership::new();
        let target = scoped(20);

        let claim = gate
            .admit(&target, ip("192.168.1.10"), &members, Uuid::new_v4(), 0)
            .unwrap();
        assert_eq!(claim.map(|c| c.bootstrap), Some(true));
        gate.confirm("local-network", claim);
        assert_eq!(
            gate.scope().accepted_classes("local-network"),
            vec![NetworkClass::V4([192, 168, 1])]
        );

        let same = gate
            .admit(&target, ip("192.168.1.77"), &members, Uuid::new_v4(), 0)
            .unwrap();
        assert_eq!(same.map(|c| c.bootstrap), Some(false));

        assert_eq!(
            gate.admit(&target, ip("10.0.0.5"), &members, Uuid::new_v4(), 0),
            Err(SessionError::Forbidden(ForbiddenReason::NetworkScope))
        );
    }

    #[test]
    fn test_scope_without_origin_is_forbidden() {
        let gate = gate();
        assert_eq!(
            gate.admit(&scoped(20), None, &Membership::new(), Uuid::new_v4(), 0),
            Err(SessionError::Forbidden(ForbiddenReason::NetworkScope))
        );
    }

    #[test]
    fn test_scope_reset() {
        let policy = SubnetPolicy::default();
        let class = NetworkClass::V4([10, 0, 0]);
        policy.bootstrap("local-network", class);
        assert_eq!(policy.decide("local-network", NetworkClass::V4([10, 0, 1])), ScopeDecision::Rejected);
        policy.reset("local-network");
        assert_eq!(policy.decide("local-network", NetworkClass::V4([10, 0, 1])), ScopeDecision::Unclaimed);
        assert!(policy.accepted_classes("local-network").is_empty());
    }

    #[test]
    fn test_allowlist_disables_bootstrap() {
        let policy = SubnetPolicy::new([NetworkClass::V4([10, 0, 0])]);
        assert_eq!(policy.decide("r", NetworkClass::V4([10, 0, 0])), ScopeDecision::Accepted);
        assert_eq!(policy.decide("r", NetworkClass::V4([10, 9, 9])), ScopeDecision::Rejected);
    }
}
