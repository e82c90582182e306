//! Protocol constants for the SCION end-host data plane.
//!
//! Wire values are fixed by the packet format and MUST NOT be changed.
//! Timer values are defaults; most of them can be overridden through
//! [`StreamConfig`](crate::stream::StreamConfig).

use std::time::Duration;

// =============================================================================
// PACKET LAYOUT
// =============================================================================

/// All header lengths are counted in lines of this many bytes.
pub const LINE_LEN: usize = 8;

/// Common header size.
pub const COMMON_HEADER_LEN: usize = 8;

/// Packed ISD-AS identifier size.
pub const ISD_AS_LEN: usize = 4;

/// Current packet format version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Host address type code for IPv4.
pub const HOST_TYPE_IPV4: u8 = 1;

/// Host address type code for IPv6.
pub const HOST_TYPE_IPV6: u8 = 2;

/// Size of the path info line that precedes the hop entries.
pub const PATH_INFO_LEN: usize = 8;

/// Size of one hop entry in the path header.
pub const HOP_ENTRY_LEN: usize = 8;

/// Largest header length expressible in the common header.
pub const MAX_HEADER_LEN: usize = u8::MAX as usize * LINE_LEN;

// =============================================================================
// EXTENSIONS
// =============================================================================

/// Extension sub-header size: next header, type, length.
pub const EXT_SUBHEADER_LEN: usize = 3;

/// Next-header value announcing a hop-by-hop extension.
pub const HOP_BY_HOP: u8 = 0;

/// Next-header value announcing an end-to-end extension.
pub const END_TO_END: u8 = 222;

/// Hop-by-hop: traceroute.
pub const EXT_TRACEROUTE: u8 = 0;

/// Hop-by-hop: SIBRA bandwidth reservation (forwarded, not interpreted).
pub const EXT_SIBRA: u8 = 1;

/// End-to-end: path transport.
pub const EXT_PATH_TRANSPORT: u8 = 0;

/// End-to-end: path liveness probe.
pub const EXT_PATH_PROBE: u8 = 1;

/// End-to-end: path reservation metadata.
pub const EXT_PATH_RESERVATION: u8 = 2;

/// One traceroute hop record.
pub const TRACEROUTE_HOP_LEN: usize = 8;

/// Largest single extension, header included.
pub const MAX_EXTENSION_LEN: usize = u8::MAX as usize * LINE_LEN;

// =============================================================================
// L4 PROTOCOLS
// =============================================================================

/// Inter-host control messages.
pub const L4_SCMP: u8 = 1;

/// Plain datagrams.
pub const L4_UDP: u8 = 17;

/// Reliable multipath stream.
pub const L4_SSP: u8 = 152;

// =============================================================================
// STREAM DEFAULTS
// =============================================================================

/// Default path MTU when a path does not carry one.
pub const DEFAULT_PATH_MTU: u16 = 1472;

/// Default receive window in data units.
pub const DEFAULT_RECV_WINDOW: usize = 256;

/// Maximum retransmissions of one data unit before the connection fails.
pub const MAX_RETRANSMITS: u32 = 10;

/// Initial handshake timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Maximum handshake retransmissions.
pub const HANDSHAKE_MAX_RETRIES: u32 = 5;

/// Backoff multiplier for handshake and data retransmission.
pub const RETRANSMIT_BACKOFF: u32 = 2;

/// Interval between liveness probes on one path.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(1000);

/// Missed probe replies (or RTO expiries) before a path is declared DOWN.
pub const PROBE_MISS_THRESHOLD: u32 = 3;

/// Time a DOWN path may stay DOWN before it expires.
pub const PATH_EXPIRY_WINDOW: Duration = Duration::from_secs(10);

/// Interval between path lookups while the active set is healthy.
pub const PATH_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of concurrently used paths.
pub const DEFAULT_MAX_PATHS: usize = 4;

/// Upper bound on tracked paths per connection.
pub const MAX_TRACKED_PATHS: usize = 20;

/// Wait for the peer FIN after our own FIN has been acknowledged.
pub const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// SACK blocks carried per segment.
pub const MAX_SACK_BLOCKS: usize = 4;

/// Per-registration inbox capacity in the dispatcher.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Pending connections a listener keeps before refusing new ones.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 64;

/// First ephemeral port handed out by the dispatcher.
pub const EPHEMERAL_PORT_MIN: u16 = 32768;

/// Last ephemeral port handed out by the dispatcher.
pub const EPHEMERAL_PORT_MAX: u16 = 60999;
