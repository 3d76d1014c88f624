//! End-to-end scenarios through the wired application state: producers →
//! bus → relay → hub → connection queue.
