//! Protocol constants shared by the stream core and the server.

/// First sequence number the generator issues in a session.
pub const FIRST_SEQUENCE: u64 = 1;

/// Largest sequence number the generator will ever issue.
///
/// Asking for a number past this fails with `SequenceExhausted`.
pub const MAX_ISSUABLE_SEQUENCE: u64 = u64::MAX - 1;

/// Reserved sequence carried only by terminal error envelopes.
///
/// It sorts after every issued number, so a consumer's observed sequence
/// stays strictly increasing even when the last thing it sees is a terminal
/// error. It is never stored in a session buffer.
pub const TERMINAL_SEQUENCE: u64 = u64::MAX;

/// Header carrying the client's declared protocol version.
pub const PROTOCOL_HEADER: &str = "x-docket-protocol";

/// Query parameter fallback for the protocol version.
pub const PROTOCOL_QUERY_PARAM: &str = "v";

/// Query parameter fallback for the bearer credential.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Query parameter carrying the client's replay cursor.
pub const LAST_ACKED_QUERY_PARAM: &str = "lastAckedSequence";

/// Query parameter naming a parked connection to resume.
pub const RESUME_QUERY_PARAM: &str = "resume";

/// Query parameter requesting live or mock mode.
pub const MODE_QUERY_PARAM: &str = "mode";
