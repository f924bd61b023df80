/// Error code registry for taskhub
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Job lifecycle errors
/// - 3000-3999: Shared store errors
/// - 4000-4999: Worker process errors
/// - 5000-5999: Admission errors
/// - 7000-7999: Validation errors
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1007;
    pub const CONFIG_VALIDATION_FAILED: u16 = 1008;

    // Job lifecycle errors (2000-2999)
    pub const JOB_GENERIC: u16 = 2000;
    pub const JOB_NOT_FOUND: u16 = 2001;
    pub const JOB_ALREADY_EXISTS: u16 = 2002;
    pub const JOB_STILL_RUNNING: u16 = 2003;
    pub const JOB_NOT_RUNNING: u16 = 2004;
    pub const JOB_PERMISSION_DENIED: u16 = 2007;

    // Shared store errors (3000-3999)
    pub const STORE_GENERIC: u16 = 3000;
    pub const STORE_UNAVAILABLE: u16 = 3001;
    pub const STORE_SCRIPT_FAILED: u16 = 3002;
    pub const STORE_TEMPORARY: u16 = 3009;
    pub const STORE_DESERIALIZATION_ERROR: u16 = 3012;

    // Worker process errors (4000-4999)
    pub const EXEC_GENERIC: u16 = 4000;
    pub const EXEC_COMMAND_NOT_FOUND: u16 = 4001;
    pub const EXEC_SUBPROCESS_FAILED: u16 = 4003;
    pub const EXEC_SPAWN_FAILED: u16 = 4007;
    pub const EXEC_OUTPUT_ERROR: u16 = 4008;

    // Admission errors (5000-5999)
    pub const ADMISSION_GENERIC: u16 = 5000;
    pub const ADMISSION_TIMEOUT: u16 = 5001;
    pub const ADMISSION_BACKEND_UNAVAILABLE: u16 = 5002;
    pub const ADMISSION_CANCELLED: u16 = 5003;

    // Validation errors (7000-7999)
    pub const VALIDATION_GENERIC: u16 = 7000;
    pub const VALIDATION_REQUIRED_FIELD: u16 = 7001;
    pub const VALIDATION_OUT_OF_RANGE: u16 = 7003;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERNAL_ERROR: u16 = 9004;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1007 => "Failed to parse configuration",
        1008 => "Configuration validation failed",

        2000 => "Generic job error",
        2001 => "Job not found",
        2002 => "Job already exists",
        2003 => "Job is still running",
        2004 => "Job is not running",
        2007 => "Permission denied for job operation",

        3000 => "Generic shared store error",
        3001 => "Shared store unavailable",
        3002 => "Shared store script failed",
        3009 => "Temporary shared store error",
        3012 => "Shared store deserialization error",

        4000 => "Generic worker error",
        4001 => "Worker command not found",
        4003 => "Worker process failed",
        4007 => "Failed to spawn worker process",
        4008 => "Worker output error",

        5000 => "Generic admission error",
        5001 => "Timed out waiting for an admission slot",
        5002 => "Admission backend unavailable",
        5003 => "Admission wait cancelled",

        7000 => "Generic validation error",
        7001 => "Required field is missing",
        7003 => "Value out of range",

        9000 => "Generic error",
        9004 => "Internal error",

        _ => "Unknown error code",
    }
}
