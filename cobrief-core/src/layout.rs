//! Pixel rectangles for resolved comment ranges.
//!
//! The rendered document is seen through [`TextContainer`]: an ordered list
//! of text nodes plus a way to measure a range between two node offsets.
//! [`get_range_pixel_position`] walks the nodes once, so it is cheap enough
//! to run on every render.

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        Rect::new(x, y, right - x, bottom - y)
    }

    /// Same rectangle expressed relative to `origin`'s top-left corner.
    pub fn relative_to(&self, origin: &Rect) -> Rect {
        Rect::new(self.x - origin.x, self.y - origin.y, self.width, self.height)
    }
}

/// Position inside a text node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOffset {
    pub node: usize,
    pub offset: usize,
}

/// Rendered text, as text nodes in document order.
pub trait TextContainer {
    fn text_node_count(&self) -> usize;

    /// Length of a node in characters.
    fn text_node_len(&self, node: usize) -> usize;

    /// Bounding box of the range between two positions, in the same
    /// coordinate space as [`TextContainer::container_bounds`].
    fn range_bounds(&self, start: NodeOffset, end: NodeOffset) -> Option<Rect>;

    fn container_bounds(&self) -> Rect;
}

/// Locate the node/offset pairs for a character range in one pass.
pub fn locate_range<C: TextContainer + ?Sized>(
    start: usize,
    end: usize,
    container: &C,
) -> Result<(NodeOffset, NodeOffset)> {
    if end < start {
        return Err(CollabError::RangeResolutionFailure);
    }
    let count = container.text_node_count();
    let mut consumed = 0;
    let mut start_pos = None;
    for node in 0..count {
        let len = container.text_node_len(node);
        // A start on a node boundary belongs to the following node.
        let holds_start = consumed + len > start || (node + 1 == count && consumed + len == start);
        if start_pos.is_none() && holds_start {
            start_pos = Some(NodeOffset {
                node,
                offset: start - consumed,
            });
        }
        if let Some(from) = start_pos {
            if consumed + len >= end {
                let to = NodeOffset {
                    node,
                    offset: end - consumed,
                };
                return Ok((from, to));
            }
        }
        consumed += len;
    }
    Err(CollabError::RangeResolutionFailure)
}

/// Bounding box of `start..end` relative to the container, or `None` when a
/// boundary cannot be located or the box has no area.
pub fn get_range_pixel_position<C: TextContainer + ?Sized>(
    start: usize,
    end: usize,
    container: &C,
) -> Option<Rect> {
    let (from, to) = locate_range(start, end, container).ok()?;
    let bounds = container.range_bounds(from, to)?;
    if bounds.area() <= 0.0 {
        return None;
    }
    Some(bounds.relative_to(&container.container_bounds()))
}

/// Fixed-pitch layout with one text node per line.
#[derive(Debug, Clone)]
pub struct MonospaceLayout {
    lines: Vec<usize>,
    origin: Rect,
    char_width: f32,
    line_height: f32,
}

impl MonospaceLayout {
    pub fn new(text: &str, origin: Rect, char_width: f32, line_height: f32) -> Self {
        Self {
            lines: text.split('\n').map(|l| l.chars().count()).collect(),
            origin,
            char_width,
            line_height,
        }
    }

    fn line_rect(&self, line: usize, from: usize, to: usize) -> Rect {
        Rect::new(
            self.origin.x + from as f32 * self.char_width,
            self.origin.y + line as f32 * self.line_height,
            (to.saturating_sub(from)) as f32 * self.char_width,
            self.line_height,
        )
    }
}

impl TextContainer for MonospaceLayout {
    fn text_node_count(&self) -> usize {
        self.lines.len()
    }

    // Each node also owns its trailing newline, except the last.
    fn text_node_len(&self, node: usize) -> usize {
        let len = self.lines.get(node).copied().unwrap_or(0);
        if node + 1 < self.lines.len() {
            len + 1
        } else {
            len
        }
    }

    fn range_bounds(&self, start: NodeOffset, end: NodeOffset) -> Option<Rect> {
        let start_len = *self.lines.get(start.node)?;
        let end_len = *self.lines.get(end.node)?;
        if start.node == end.node {
            return Some(self.line_rect(start.node, start.offset, end.offset.min(end_len)));
        }
        let mut bounds = self.line_rect(start.node, start.offset, start_len);
        for line in start.node + 1..end.node {
            bounds = bounds.union(&self.line_rect(line, 0, self.lines[line]));
        }
        Some(bounds.union(&self.line_rect(end.node, 0, end.offset.min(end_len))))
    }

    fn container_bounds(&self) -> Rect {
        self.origin
    }
}
