use src_loc::SrcLoc;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
    }

    foreign_links {
        FmtError(::std::fmt::Error);
        JsonError(::serde_json::Error);
    }

    errors {
        AssemblerError(loc: SrcLoc, msg: String) {
            description("Failed to assemble")
            display("{}: {}", loc, msg)
        }
        InternalError(msg: String) {
            description("Internal assembler error")
            display("internal error: {}", msg)
        }
    }
}

/// Shorthand for the fatal-with-location case the evaluator and the
/// writers report everywhere.
pub fn fatal<T>(loc: &SrcLoc, msg: String) -> Result<T> {
    Err(ErrorKind::AssemblerError(loc.clone(), msg).into())
}
