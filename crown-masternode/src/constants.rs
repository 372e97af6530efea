/// One coin in base units.
pub const COIN: u64 = 100_000_000;

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u32 = 70058;

/// Oldest protocol a masternode may run and still take part in InstantSend voting.
pub const MIN_INSTANTX_PROTO_VERSION: u32 = 70040;

/// Peers below this version have their payment winner messages ignored.
pub const MIN_WINNER_PEER_PROTO_VERSION: u32 = 70057;

/// Minimum node protocol to be paid while the "don't pay old nodes" spork is off.
pub const MIN_PAYMENT_PROTO_VERSION_PREV: u32 = 70057;

/// Minimum node protocol to be paid once the "don't pay old nodes" spork is on.
pub const MIN_PAYMENT_PROTO_VERSION_CURR: u32 = 70058;

/// Matching lock votes needed before a transaction is locked.
pub const INSTANTX_SIGNATURES_REQUIRED: usize = 6;

/// Size of the lock voting quorum (top-ranked masternodes).
pub const INSTANTX_SIGNATURES_TOTAL: usize = 10;

/// Votes on one payee needed before block payment is enforced.
pub const PAYMENT_SIGNATURES_REQUIRED: u32 = 6;

/// Size of the payment voting quorum.
pub const PAYMENT_SIGNATURES_TOTAL: usize = 10;

/// Transactions older than this many blocks are no longer lockable.
pub const IX_ACCEPTED_BLOCK_COUNT: u64 = 24;

/// Wall-clock seconds per block used to derive lock lifetimes.
pub const IX_SECONDS_PER_BLOCK: i64 = 60;

/// A lock ballot is dropped this long after creation.
pub const IX_LOCK_EXPIRATION_SECONDS: i64 = IX_SECONDS_PER_BLOCK * IX_ACCEPTED_BLOCK_COUNT as i64;

/// After this long a lock that has not completed is reported as timed out.
pub const IX_LOCK_TIMEOUT_SECONDS: i64 = IX_SECONDS_PER_BLOCK * 5;

/// Every input of a lock request needs at least this many confirmations.
pub const IX_MIN_INPUT_CONFIRMATIONS: u64 = 5;

/// Added to `tip - input_age` to get the voting height of a lock.
pub const IX_HEIGHT_OFFSET: u64 = 4;

/// Blocks replayed when a rejected transaction turns out to be locked.
pub const IX_REPROCESS_BLOCKS: u64 = 15;

/// Spacing allowed between votes from a voter whose lock request is not known yet.
pub const IX_UNKNOWN_VOTE_WINDOW: i64 = 60 * 10;

/// Payment votes for height `h` are ranked at `h - PAYMENT_RANK_OFFSET`.
pub const PAYMENT_RANK_OFFSET: u64 = 100;

/// Winners may be announced this far ahead of the tip.
pub const WINNER_LOOKAHEAD_BLOCKS: u64 = 20;

/// On a new tip, own payment votes are cast for the block this far ahead.
pub const OWN_VOTE_OFFSET: u64 = 10;

/// A node already voted in for one of the next this-many blocks is not picked again.
pub const SCHEDULED_PAYMENT_WINDOW: u64 = 8;

/// Lower bound for the payment vote retention window.
pub const MIN_PAYMENT_RETENTION_BLOCKS: u64 = 1000;

/// Votes on a payee within a ballot before it counts as "paid" for last-paid scans.
pub const LAST_PAID_MIN_VOTES: u32 = 2;

/// Allowed skew between a message's signing time and local time.
pub const MAX_SIG_TIME_SKEW: i64 = 60 * 60;

/// A ping must reference a block no older than this many blocks below the tip.
pub const PING_MAX_BLOCK_AGE: u64 = 24;

/// A peer may ask for the full node list once per this many seconds.
pub const LIST_REQUEST_SECONDS: i64 = 3 * 60 * 60;

/// Nodes that were never paid report one month plus a spread derived from their outpoint.
pub const NEVER_PAID_SECONDS: i64 = 30 * 24 * 60 * 60;

/// Upper bound of the never-paid spread, in seconds.
pub const NEVER_PAID_SPREAD: u64 = 150;

/// Reprocess requests look this many seconds back per block when clearing failed blocks.
pub const REPROCESS_SECONDS_PER_BLOCK: i64 = 5 * 60;

/// DoS weights applied by the dispatcher.
pub const DOS_FUTURE_SIG_TIME: u32 = 1;
pub const DOS_BAD_PING_SIGNATURE: u32 = 33;
pub const DOS_REPEATED_LIST_REQUEST: u32 = 34;
pub const DOS_WINNER_RANK_ABUSE: u32 = 20;
pub const DOS_WINNER_BAD_SIGNATURE: u32 = 20;
pub const DOS_REPEATED_WINNER_REQUEST: u32 = 20;
pub const DOS_BAD_KEY: u32 = 100;
pub const DOS_BAD_SPORK_SIGNATURE: u32 = 100;
