use shared::domain::MessageContent;
use shared::protocol::{Extension, Transformation};

use crate::ns;

/// Parses the content parts of one transformation, and the `[start, end)`
/// span of a quoted-reply prefix inside the body, if any.
///
/// A single body that textually equals the single out-of-band reference is
/// a redundant echo of a share link and collapses into one file part.
/// Otherwise text parts come first in source order, then file parts.
pub fn parse_contents(
    transformation: &Transformation,
) -> (Vec<MessageContent>, Option<(u32, u32)>) {
    let bodies: Vec<(&str, Option<&str>)> = transformation.bodies().collect();
    let urls: Vec<&str> = transformation.out_of_band_urls().collect();

    let reply_fallback = transformation
        .fallback_for(ns::REPLY)
        .and_then(|(start, end)| match (start, end) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        });

    // a whole-body fallback for anything but a reply quote means the body
    // only mirrors an extension this client renders natively
    let whole_body_fallback = transformation.extensions.iter().any(|extension| {
        matches!(
            extension,
            Extension::Fallback {
                for_namespace,
                body_start: None,
                body_end: None,
            } if for_namespace != ns::REPLY
        )
    });

    if bodies.len() == 1 && urls.len() == 1 {
        let (text, _) = bodies[0];
        let url = urls[0];
        if !url.is_empty() && url == text {
            return (vec![MessageContent::file(url)], reply_fallback);
        }
    }

    let mut contents = Vec::new();
    if !whole_body_fallback {
        for (text, language) in bodies {
            if text.is_empty() {
                continue;
            }
            contents.push(MessageContent::text(text, language.map(str::to_owned)));
        }
    }
    for url in urls {
        if url.is_empty() {
            continue;
        }
        contents.push(MessageContent::file(url));
    }
    (contents, reply_fallback)
}
