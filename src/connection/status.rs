//! HTTP status reason phrases and generated error pages.

/// Reason phrase for a status code, if it is a registered one.
pub fn reason_phrase(status: u16) -> Option<&'static str> {
    let phrase = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => return None,
    };
    Some(phrase)
}

/// Status line fragment, e.g. `403 Forbidden`, or just the code if unregistered.
pub fn status_line(status: u16) -> String {
    match reason_phrase(status) {
        Some(phrase) => format!("{} {}", status, phrase),
        None => status.to_string(),
    }
}

fn explanation(status: u16) -> &'static str {
    match status {
        400 => "The server cannot process your request.",
        401 => "The necessary credentials have not been provided.",
        403 => "You do not have the necessary permissions to view this page.",
        404 => "The requested URL was not found on this server.",
        405 => "The used request method is not supported for the requested resource.",
        406 => "The requested function is unable to produce a resource that satisfies your browser's Accept header.",
        408 => "A timeout occurred while waiting for your request.",
        409 => "Your request conflicts with the current state of the resource.",
        410 => "The requested resource is no longer available.",
        413 => "The request is larger than the server is willing to process.",
        414 => "The request URI is too long.",
        415 => "The media type of your request is not supported.",
        429 => "You have sent too many requests in a given amount of time.",
        500 => "An unexpected condition prevented the server from fulfilling your request.",
        501 => "The server does not support the functionality required to fulfill your request.",
        502 => "The server received an invalid response from an upstream server.",
        503 => "The server is currently unable to handle your request.",
        504 => "The server did not receive a timely response from an upstream server.",
        _ => "The server was unable to complete your request.",
    }
}

/// Generate a minimal HTML error page for the given status.
pub fn error_page(status: u16) -> String {
    let title = status_line(status);
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        explanation(status)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_status_lines() {
        assert_eq!(status_line(403), "403 Forbidden");
        assert_eq!(status_line(299), "299");
    }

    #[test]
    fn error_page_carries_title() {
        let page = error_page(404);
        assert!(page.contains("<title>404 Not Found</title>"));
        assert!(page.contains("was not found"));
    }
}
