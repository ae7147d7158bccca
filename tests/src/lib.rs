#[cfg(test)]
mod util;

#[cfg(test)]
mod generation;
#[cfg(test)]
mod pipeline;
