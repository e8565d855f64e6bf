//! # inkwell-core: shared canvas model for Inkwell
//!
//! Shape records plus the convergence core that replicates them:
//!
//! ```text
//!  UI ── LocalOp ──► Replica ──► Document (RGA) ──► Update ──► codec ──► wire
//!                      │             ▲
//!                      ▼             │ apply_remote
//!                 UndoManager ───────┘ (inverse via local path)
//! ```
//!
//! Shapes are plain immutable values. Editing a shape means replacing the
//! record at its position with a new record carrying the same [`ShapeId`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod collab;

pub use collab::{
    codec, ActorId, ApplyReport, Change, DecodeError, DocEvent, Document, ElementId, LocalOp,
    ObserverId, Op, Replica, Snapshot, StateVector, Transaction, UndoConfig, UndoError,
    UndoManager, Update, MAX_REMOTE_CLOCK,
};

/// Stroke width used by the pen tool when none is given.
pub const DEFAULT_STROKE_WIDTH: f32 = 4.0;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Origin + extent. Extents may be negative while a shape is dragged up or left.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Globally unique shape identifier, immutable for the record's lifetime.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub String);

impl ShapeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier for a newly drawn shape.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShapeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// CSS-style color string, e.g. `#ff8800`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub struct Color(pub String);

impl Color {
    pub fn new(color: impl Into<String>) -> Self {
        Self(color.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Color {
    fn default() -> Self {
        Self("#000000".to_string())
    }
}

/// Freehand pen stroke.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StrokeShape {
    pub id: ShapeId,
    pub color: Color,
    pub width: f32,
    pub points: Vec<Point>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct RectShape {
    pub id: ShapeId,
    pub color: Color,
    pub bounds: Rect,
}

/// Ellipse inscribed in `bounds`; the radii are half the extent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct EllipseShape {
    pub id: ShapeId,
    pub color: Color,
    pub bounds: Rect,
}

impl EllipseShape {
    pub fn radius_x(&self) -> f32 {
        self.bounds.width.abs() / 2.0
    }

    pub fn radius_y(&self) -> f32 {
        self.bounds.height.abs() / 2.0
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Stroke,
    Rect,
    Ellipse,
}

/// A shape record on the canvas.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Shape {
    Stroke(StrokeShape),
    Rect(RectShape),
    Ellipse(EllipseShape),
}

impl Shape {
    pub fn stroke(id: impl Into<ShapeId>, color: Color, points: Vec<Point>) -> Self {
        Shape::Stroke(StrokeShape {
            id: id.into(),
            color,
            width: DEFAULT_STROKE_WIDTH,
            points,
        })
    }

    pub fn rect(id: impl Into<ShapeId>, color: Color, bounds: Rect) -> Self {
        Shape::Rect(RectShape {
            id: id.into(),
            color,
            bounds,
        })
    }

    pub fn ellipse(id: impl Into<ShapeId>, color: Color, bounds: Rect) -> Self {
        Shape::Ellipse(EllipseShape {
            id: id.into(),
            color,
            bounds,
        })
    }

    pub fn id(&self) -> &ShapeId {
        match self {
            Shape::Stroke(s) => &s.id,
            Shape::Rect(r) => &r.id,
            Shape::Ellipse(e) => &e.id,
        }
    }

    pub fn color(&self) -> &Color {
        match self {
            Shape::Stroke(s) => &s.color,
            Shape::Rect(r) => &r.color,
            Shape::Ellipse(e) => &e.color,
        }
    }

    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Stroke(_) => ShapeKind::Stroke,
            Shape::Rect(_) => ShapeKind::Rect,
            Shape::Ellipse(_) => ShapeKind::Ellipse,
        }
    }

    /// Record the shape would have after the pointer moved to `to` while drawing.
    ///
    /// Strokes gain a point; rectangles and ellipses stretch from their origin.
    pub fn drag_to(&self, to: Point) -> Shape {
        match self {
            Shape::Stroke(s) => {
                let mut next = s.clone();
                next.points.push(to);
                Shape::Stroke(next)
            }
            Shape::Rect(r) => {
                let mut next = r.clone();
                next.bounds.width = to.x - r.bounds.x;
                next.bounds.height = to.y - r.bounds.y;
                Shape::Rect(next)
            }
            Shape::Ellipse(e) => {
                let mut next = e.clone();
                next.bounds.width = (to.x - e.bounds.x).abs();
                next.bounds.height = (to.y - e.bounds.y).abs();
                Shape::Ellipse(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_structure() {
        let shape = Shape::rect("r1", Color::default(), Rect::new(10.0, 20.0, 100.0, 50.0));

        match &shape {
            Shape::Rect(r) => {
                assert_eq!(r.bounds.x, 10.0);
                assert_eq!(r.bounds.width, 100.0);
            }
            _ => panic!("Wrong shape type"),
        }
        assert_eq!(shape.id().as_str(), "r1");
        assert_eq!(shape.kind(), ShapeKind::Rect);
        assert_eq!(shape.color().as_str(), "#000000");
    }

    #[test]
    fn test_generated_ids_unique() {
        assert_ne!(ShapeId::generate(), ShapeId::generate());
    }

    #[test]
    fn test_drag_rect_sets_extent() {
        let rect = Shape::rect("r", Color::default(), Rect::new(5.0, 5.0, 0.0, 0.0));
        let dragged = rect.drag_to(Point::new(2.0, 15.0));

        match dragged {
            Shape::Rect(r) => {
                assert_eq!(r.bounds.width, -3.0);
                assert_eq!(r.bounds.height, 10.0);
                assert_eq!(r.id.as_str(), "r");
            }
            _ => panic!("Wrong shape type"),
        }
    }

    #[test]
    fn test_drag_ellipse_uses_absolute_extent() {
        let ellipse = Shape::ellipse("e", Color::default(), Rect::new(10.0, 10.0, 0.0, 0.0));
        let Shape::Ellipse(e) = ellipse.drag_to(Point::new(0.0, 30.0)) else {
            panic!("Wrong shape type");
        };

        assert_eq!(e.bounds.width, 10.0);
        assert_eq!(e.radius_x(), 5.0);
        assert_eq!(e.radius_y(), 10.0);
    }

    #[test]
    fn test_drag_stroke_appends_point() {
        let stroke = Shape::stroke("s", Color::new("#ff0000"), vec![Point::new(0.0, 0.0)]);
        let Shape::Stroke(s) = stroke.drag_to(Point::new(1.0, 1.0)) else {
            panic!("Wrong shape type");
        };

        assert_eq!(s.points.len(), 2);
        assert_eq!(s.width, DEFAULT_STROKE_WIDTH);
        assert_eq!(s.color.as_str(), "#ff0000");
    }
}
