/// URL surface
/// `/` is the landing route, `/room/{roomId}` an editor session; landing
/// without a room generates one and redirects to it
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::{Result, RoomError, RoomId};

const ROOM_PREFIX: &str = "/room/";

// Characters that cannot appear raw in a path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Landing,
    Room(RoomId),
}

/// Where a route leads once resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Open an editor session for this room
    Session(RoomId),

    /// Replace the current location with this route
    Redirect(Route),
}

impl Route {
    /// Parse a request path; query string and fragment are ignored
    pub fn parse(path: &str) -> Result<Self> {
        let path = path
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or_default();

        if path.is_empty() || path == "/" {
            return Ok(Route::Landing);
        }

        let segment = path
            .strip_prefix(ROOM_PREFIX)
            .map(|rest| rest.strip_suffix('/').unwrap_or(rest))
            .ok_or_else(|| RoomError::InvalidRoute(path.to_string()))?;

        let decoded = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| RoomError::InvalidRoute(path.to_string()))?;

        RoomId::new(decoded.into_owned())
            .map(Route::Room)
            .map_err(|_| RoomError::InvalidRoute(path.to_string()))
    }

    pub fn path(&self) -> String {
        match self {
            Route::Landing => "/".to_string(),
            Route::Room(room_id) => room_path(room_id),
        }
    }

    /// Landing generates a fresh room and redirects there
    pub fn resolve(self) -> RouteTarget {
        match self {
            Route::Landing => RouteTarget::Redirect(Route::Room(RoomId::generate())),
            Route::Room(room_id) => RouteTarget::Session(room_id),
        }
    }
}

pub fn room_path(room_id: &RoomId) -> String {
    format!(
        "{}{}",
        ROOM_PREFIX,
        utf8_percent_encode(room_id.as_str(), PATH_SEGMENT)
    )
}

/// `{origin}/room/{roomId}`
pub fn share_link(origin: &str, room_id: &RoomId) -> String {
    format!("{}{}", origin.trim_end_matches('/'), room_path(room_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_routes() {
        assert_eq!(Route::parse("/").unwrap(), Route::Landing);
        assert_eq!(Route::parse("").unwrap(), Route::Landing);
        assert_eq!(Route::parse("/?ref=x").unwrap(), Route::Landing);
        assert_eq!(
            Route::parse("/room/abc").unwrap(),
            Route::Room(RoomId::new("abc").unwrap())
        );
        assert_eq!(
            Route::parse("/room/abc/?x=1").unwrap(),
            Route::Room(RoomId::new("abc").unwrap())
        );
    }

    #[test]
    fn test_parse_rejects_unknown_paths() {
        assert!(Route::parse("/rooms/abc").is_err());
        assert!(Route::parse("/room/").is_err());
        assert!(Route::parse("/room/a/b").is_err());
        assert!(Route::parse("/favicon.ico").is_err());
    }

    #[test]
    fn test_landing_redirects_to_generated_room() {
        match Route::Landing.resolve() {
            RouteTarget::Redirect(Route::Room(id)) => {
                assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
            }
            other => panic!("unexpected target {:?}", other),
        }

        let id = RoomId::new("keep").unwrap();
        assert_eq!(
            Route::Room(id.clone()).resolve(),
            RouteTarget::Session(id)
        );
    }

    #[test]
    fn test_path_round_trips_through_encoding() {
        let id = RoomId::new("équipe%1").unwrap();
        let path = Route::Room(id.clone()).path();
        assert_eq!(path, "/room/%C3%A9quipe%251");
        assert_eq!(Route::parse(&path).unwrap(), Route::Room(id));
    }

    #[test]
    fn test_share_link() {
        let id = RoomId::new("r-1").unwrap();
        assert_eq!(
            share_link("https://example.com/", &id),
            "https://example.com/room/r-1"
        );
        assert_eq!(
            share_link("http://localhost:5173", &id),
            "http://localhost:5173/room/r-1"
        );
    }
}
