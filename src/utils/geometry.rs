use std::{fmt, marker::PhantomData};

/// Type-level marker for the physical coordinate space of a crtc (pixels of the mode)
#[derive(Debug)]
pub struct Physical;

/// Type-level marker for the buffer coordinate space of a framebuffer
#[derive(Debug)]
pub struct Buffer;

/// A point as defined by its x and y coordinates
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

impl<N, Kind> Point<N, Kind> {
    /// Creates a new point
    pub const fn new(x: N, y: N) -> Self {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Point<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point").field("x", &self.x).field("y", &self.y).finish()
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    fn from((x, y): (N, N)) -> Self {
        Point::new(x, y)
    }
}

impl<N: Clone, Kind> Clone for Point<N, Kind> {
    fn clone(&self) -> Self {
        Point::new(self.x.clone(), self.y.clone())
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Default, Kind> Default for Point<N, Kind> {
    fn default() -> Self {
        Point::new(N::default(), N::default())
    }
}

/// A size as defined by its width and height
pub struct Size<N, Kind> {
    /// horizontal coordinate
    pub w: N,
    /// vertical coordinate
    pub h: N,
    _kind: PhantomData<Kind>,
}

impl<N, Kind> Size<N, Kind> {
    /// Creates a new size
    pub const fn new(w: N, h: N) -> Self {
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Size<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size").field("w", &self.w).field("h", &self.h).finish()
    }
}

impl<N, Kind> From<(N, N)> for Size<N, Kind> {
    fn from((w, h): (N, N)) -> Self {
        Size::new(w, h)
    }
}

impl<N: Clone, Kind> Clone for Size<N, Kind> {
    fn clone(&self) -> Self {
        Size::new(self.w.clone(), self.h.clone())
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Default, Kind> Default for Size<N, Kind> {
    fn default() -> Self {
        Size::new(N::default(), N::default())
    }
}

/// A rectangle defined by its top-left corner and dimensions
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N, Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N, Kind>,
}

impl<N, Kind> Rectangle<N, Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }
}

impl<Kind> Rectangle<i32, Kind> {
    /// Convert to f64
    pub fn to_f64(self) -> Rectangle<f64, Kind> {
        Rectangle::from_loc_and_size(
            (self.loc.x as f64, self.loc.y as f64),
            (self.size.w as f64, self.size.h as f64),
        )
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Rectangle<N, Kind> {
    fn clone(&self) -> Self {
        Rectangle {
            loc: self.loc.clone(),
            size: self.size.clone(),
        }
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Default, Kind> Default for Rectangle<N, Kind> {
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}
